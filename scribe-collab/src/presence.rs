//! Presence (awareness) tracking for connected clients.
//!
//! Every connection in a room owns exactly one [`PresenceRecord`]. Records
//! are replaced wholesale on each update, removed when the connection leaves
//! and never persisted. Each mutation yields a [`PresenceChange`] for the
//! room to fan out to the remaining members.
//!
//! ```text
//! client presence update ──► PresenceTracker::set_local_state()
//!                                   │
//!                                   ▼
//!                       PresenceChange::Updated(record)
//!                                   │   (relay fan-out, N-1 peers)
//!                                   ▼
//!                            remote editors
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::ids::ConnectionId;

/// Display name used when a client does not provide one.
pub const ANONYMOUS: &str = "Anonymous";

/// A cursor or selection, as positions in the rendered text.
///
/// `anchor == head` is a collapsed caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(at: u32) -> Self {
        Self { anchor: at, head: at }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// Presence attributes a client sends about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceFields {
    /// Stable user identifier supplied by the client.
    pub user_id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// CSS color (`#rrggbb`); derived from the connection id when absent.
    pub color: Option<String>,
    pub cursor: Option<CursorRange>,
}

impl PresenceFields {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, cursor: CursorRange) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Presence record as seen by the other members of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub connection: ConnectionId,
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
}

impl PresenceRecord {
    /// Fill in defaults for anything the client left out.
    pub fn from_fields(connection: ConnectionId, fields: PresenceFields) -> Self {
        let name = fields
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string());
        let color = fields
            .color
            .filter(|c| is_hex_color(c))
            .unwrap_or_else(|| color_for(connection.as_uuid()));
        Self {
            connection,
            user_id: fields.user_id.unwrap_or_else(|| connection.to_string()),
            name,
            color,
            cursor: fields.cursor,
        }
    }
}

/// Notification produced by a presence mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Updated(PresenceRecord),
    Removed(ConnectionId),
}

/// Presence state of one room.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    states: BTreeMap<ConnectionId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record owned by `connection`.
    pub fn set_local_state(
        &mut self,
        connection: ConnectionId,
        fields: PresenceFields,
    ) -> PresenceChange {
        let record = PresenceRecord::from_fields(connection, fields);
        self.states.insert(connection, record.clone());
        PresenceChange::Updated(record)
    }

    /// Snapshot of every record, ordered by connection id.
    pub fn get_all_states(&self) -> Vec<PresenceRecord> {
        self.states.values().cloned().collect()
    }

    pub fn get(&self, connection: &ConnectionId) -> Option<&PresenceRecord> {
        self.states.get(connection)
    }

    /// Drop the record owned by `connection`.
    ///
    /// Returns `None` if the connection had no record, so nothing needs to
    /// be announced.
    pub fn remove_state(&mut self, connection: &ConnectionId) -> Option<PresenceChange> {
        self.states
            .remove(connection)
            .map(|record| PresenceChange::Removed(record.connection))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid `#rrggbb` color for an id.
///
/// Hue comes from the id hash; saturation and lightness are fixed so that
/// cursors stay readable on a white page.
pub fn color_for(id: Uuid) -> String {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.45);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_local_state_replaces_wholesale() {
        let mut tracker = PresenceTracker::new();
        let conn = ConnectionId::new();

        tracker.set_local_state(
            conn,
            PresenceFields::named("Alice").with_cursor(CursorRange::caret(3)),
        );
        tracker.set_local_state(conn, PresenceFields::named("Alice B."));

        let record = tracker.get(&conn).unwrap();
        assert_eq!(record.name, "Alice B.");
        assert!(record.cursor.is_none(), "old cursor must not survive a replace");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_defaults_filled_in() {
        let conn = ConnectionId::new();
        let record = PresenceRecord::from_fields(conn, PresenceFields::default());
        assert_eq!(record.name, ANONYMOUS);
        assert_eq!(record.user_id, conn.to_string());
        assert!(is_hex_color(&record.color));
    }

    #[test]
    fn test_invalid_color_replaced() {
        let conn = ConnectionId::new();
        let fields = PresenceFields {
            color: Some("red".into()),
            ..PresenceFields::default()
        };
        let record = PresenceRecord::from_fields(conn, fields);
        assert_eq!(record.color, color_for(conn.as_uuid()));
    }

    #[test]
    fn test_client_color_kept() {
        let fields = PresenceFields {
            color: Some("#a1b2c3".into()),
            ..PresenceFields::default()
        };
        let record = PresenceRecord::from_fields(ConnectionId::new(), fields);
        assert_eq!(record.color, "#a1b2c3");
    }

    #[test]
    fn test_remove_state_notifies_once() {
        let mut tracker = PresenceTracker::new();
        let conn = ConnectionId::new();
        tracker.set_local_state(conn, PresenceFields::named("Bob"));

        assert_eq!(tracker.remove_state(&conn), Some(PresenceChange::Removed(conn)));
        assert_eq!(tracker.remove_state(&conn), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_get_all_states() {
        let mut tracker = PresenceTracker::new();
        tracker.set_local_state(ConnectionId::new(), PresenceFields::named("A"));
        tracker.set_local_state(ConnectionId::new(), PresenceFields::named("B"));

        let mut names: Vec<String> = tracker.get_all_states().into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_color_stable_per_id() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(color_for(id), color_for(id));
        assert!(is_hex_color(&color_for(id)));
    }

    #[test]
    fn test_cursor_range() {
        assert!(CursorRange::caret(4).is_collapsed());
        assert!(!CursorRange { anchor: 1, head: 4 }.is_collapsed());
    }
}
