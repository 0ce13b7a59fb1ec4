//! Booking authority access.
//!
//! The booking calendar lives outside this crate and is only ever read. Given
//! an instant, the authority returns every reservation covering it; the core
//! then picks the most recent one for the identity it cares about.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::path::PathBuf;

use crate::error::{store_err, AuthorizationError, Result, RigError};
use crate::window::BookingWindow;

/// Identity that is granted the unbounded window without a reservation.
pub const ADMIN_IDENTITY: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub identity: String,
    pub window: BookingWindow,
}

pub trait BookingAuthority: Send + Sync {
    /// Every reservation whose window contains `now`.
    fn bookings_at(&self, now: DateTime<Utc>) -> Result<Vec<Booking>>;
}

/// Resolves the window an identity may use at `now`.
///
/// The admin identity is never looked up. For everyone else the latest-starting
/// matching booking wins.
pub fn resolve_window(
    authority: &dyn BookingAuthority,
    identity: &str,
    now: DateTime<Utc>,
) -> Result<BookingWindow> {
    if identity == ADMIN_IDENTITY {
        return Ok(BookingWindow::unbounded());
    }

    authority
        .bookings_at(now)?
        .into_iter()
        .filter(|booking| booking.identity == identity)
        .max_by_key(|booking| (booking.window.start, booking.window.end))
        .map(|booking| booking.window)
        .ok_or_else(|| {
            AuthorizationError::NoBooking {
                identity: identity.to_string(),
            }
            .into()
        })
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite-backed calendar
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only view of a `bookings(identity, start_ms, end_ms)` table.
pub struct SqliteBookingAuthority {
    path: PathBuf,
}

impl SqliteBookingAuthority {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn open(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(store_err("Failed to open bookings db"))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(store_err("Failed to set busy_timeout"))?;
        Ok(conn)
    }
}

impl BookingAuthority for SqliteBookingAuthority {
    fn bookings_at(&self, now: DateTime<Utc>) -> Result<Vec<Booking>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT identity, start_ms, end_ms FROM bookings \
                 WHERE ?1 >= start_ms AND ?1 <= end_ms \
                 ORDER BY start_ms ASC",
            )
            .map_err(store_err("Failed to prepare bookings query"))?;

        let rows = stmt
            .query_map(params![now.timestamp_millis()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(store_err("Failed to read booking rows"))?;

        let mut bookings = Vec::new();
        for row in rows {
            let (identity, start_ms, end_ms) = row.map_err(store_err("Failed to decode booking row"))?;
            match window_from_millis(start_ms, end_ms) {
                Some(window) => bookings.push(Booking { identity, window }),
                None => {
                    tracing::warn!(
                        identity = %identity,
                        start_ms,
                        end_ms,
                        "Skipping malformed booking row"
                    );
                }
            }
        }

        Ok(bookings)
    }
}

fn window_from_millis(start_ms: i64, end_ms: i64) -> Option<BookingWindow> {
    let start = DateTime::from_timestamp_millis(start_ms)?;
    let end = DateTime::from_timestamp_millis(end_ms)?;
    BookingWindow::new(start, end)
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory calendar
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed list of bookings, filtered by instant like the real calendar.
#[derive(Debug, Default, Clone)]
pub struct StaticBookings {
    bookings: Vec<Booking>,
}

impl StaticBookings {
    pub fn new(bookings: Vec<Booking>) -> Self {
        Self { bookings }
    }

    pub fn with(
        mut self,
        identity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        let window = BookingWindow::new(start, end)
            .ok_or_else(|| RigError::validation("booking", "start must not be after end"))?;
        self.bookings.push(Booking {
            identity: identity.to_string(),
            window,
        });
        Ok(self)
    }
}

impl BookingAuthority for StaticBookings {
    fn bookings_at(&self, now: DateTime<Utc>) -> Result<Vec<Booking>> {
        Ok(self
            .bookings
            .iter()
            .filter(|booking| crate::window::authorized(now, &booking.window))
            .cloned()
            .collect())
    }
}
