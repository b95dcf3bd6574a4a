//! Replicated document state.
//!
//! A [`Replica`] wraps a Yrs `Doc` whose rich-text content lives in a single
//! shared text type named [`CONTENT_FIELD`]. Edits are sequence operations with
//! formatting attributes, so concurrent inserts at different positions never
//! overwrite each other and concurrent inserts at the same position are
//! ordered by the Yrs client-id tie-break.
//!
//! All state leaves the replica as Yrs v1 updates:
//! - full state (bootstrap + persistence): diff against the empty state vector
//! - deltas: diff against the state vector observed before an edit
//!
//! Applying an update is idempotent and commutative; updates whose causal
//! dependencies have not arrived yet are parked by Yrs until they do.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use yrs::encoding::read::{Cursor, Error as ReadError, Read};
use yrs::types::text::{Diff, YChange};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

pub use yrs::types::Attrs;

/// Name of the shared text holding document content.
pub const CONTENT_FIELD: &str = "content";

/// Replica errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicaError {
    /// A stored full-state snapshot could not be decoded or applied.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    /// An incoming delta could not be decoded or applied.
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    /// A peer's state vector could not be decoded.
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
}

/// A run of text sharing one set of formatting marks.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub marks: Attrs,
}

/// Build a formatting attribute map, e.g. `marks(&[("bold", true.into())])`.
pub fn marks(pairs: &[(&str, Any)]) -> Attrs {
    pairs
        .iter()
        .map(|(name, value)| (Arc::<str>::from(*name), value.clone()))
        .collect::<HashMap<_, _>>()
}

/// Whether `update` carries neither insertions nor deletions.
pub fn is_noop(update: &[u8]) -> bool {
    decode_update(update).is_ok_and(|u| u.is_empty())
}

/// Decode a v1 update from untrusted bytes.
///
/// Yrs trusts string payloads to be UTF-8 and never checks them, so every
/// string in the block section is validated before Yrs sees the buffer.
fn decode_update(bytes: &[u8]) -> Result<Update, ReadError> {
    scan::check_update(bytes)?;
    Update::decode_v1(bytes)
}

/// Structural walk over the block section of a v1 update.
mod scan {
    use super::{Cursor, Read, ReadError};

    const GC: u8 = 0;
    const DELETED: u8 = 1;
    const JSON: u8 = 2;
    const BINARY: u8 = 3;
    const STRING: u8 = 4;
    const EMBED: u8 = 5;
    const FORMAT: u8 = 6;
    const TYPE: u8 = 7;
    const ANY: u8 = 8;
    const SKIP: u8 = 10;

    const HAS_ORIGIN: u8 = 0b1000_0000;
    const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
    const HAS_PARENT_SUB: u8 = 0b0010_0000;

    const TYPE_XML_ELEMENT: u8 = 3;
    const TYPE_WEAK: u8 = 7;

    /// Nesting limit for `Any` values.
    const MAX_DEPTH: usize = 64;

    pub(super) fn check_update(bytes: &[u8]) -> Result<(), ReadError> {
        let mut cursor = Cursor::new(bytes);
        let clients: u32 = cursor.read_var()?;
        for _ in 0..clients {
            let blocks: u32 = cursor.read_var()?;
            let _client: u32 = cursor.read_var()?;
            let _clock: u32 = cursor.read_var()?;
            for _ in 0..blocks {
                block(&mut cursor)?;
            }
        }
        // The delete set that follows holds only integers.
        Ok(())
    }

    fn block(cursor: &mut Cursor<'_>) -> Result<(), ReadError> {
        let info = cursor.read_u8()?;
        if info == GC || info == SKIP {
            let _len: u32 = cursor.read_var()?;
            return Ok(());
        }
        if info & HAS_ORIGIN != 0 {
            id(cursor)?;
        }
        if info & HAS_RIGHT_ORIGIN != 0 {
            id(cursor)?;
        }
        if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
            let named: u32 = cursor.read_var()?;
            if named == 1 {
                string(cursor)?;
            } else {
                id(cursor)?;
            }
            if info & HAS_PARENT_SUB != 0 {
                string(cursor)?;
            }
        }
        content(cursor, info & 0b1111)
    }

    fn content(cursor: &mut Cursor<'_>, kind: u8) -> Result<(), ReadError> {
        match kind {
            DELETED => {
                let _len: u32 = cursor.read_var()?;
            }
            JSON => {
                // One more string than the stored count.
                let count: u32 = cursor.read_var()?;
                for _ in 0..=count {
                    string(cursor)?;
                }
            }
            BINARY => {
                cursor.read_buf()?;
            }
            STRING | EMBED => string(cursor)?,
            FORMAT => {
                string(cursor)?;
                string(cursor)?;
            }
            TYPE => match cursor.read_u8()? {
                TYPE_XML_ELEMENT => string(cursor)?,
                TYPE_WEAK => return Err(unsupported("weak link")),
                _ => {}
            },
            ANY => {
                let count: u32 = cursor.read_var()?;
                for _ in 0..count {
                    any(cursor, 0)?;
                }
            }
            // Subdocuments and moves never occur in a text document.
            _ => return Err(unsupported("block content")),
        }
        Ok(())
    }

    fn any(cursor: &mut Cursor<'_>, depth: usize) -> Result<(), ReadError> {
        if depth > MAX_DEPTH {
            return Err(unsupported("nesting depth"));
        }
        match cursor.read_u8()? {
            120 | 121 | 126 | 127 => {}
            125 => {
                let _n: i64 = cursor.read_var()?;
            }
            124 => {
                cursor.read_exact(4)?;
            }
            122 | 123 => {
                cursor.read_exact(8)?;
            }
            119 => string(cursor)?,
            118 => {
                let len: u32 = cursor.read_var()?;
                for _ in 0..len {
                    string(cursor)?;
                    any(cursor, depth + 1)?;
                }
            }
            117 => {
                let len: u32 = cursor.read_var()?;
                for _ in 0..len {
                    any(cursor, depth + 1)?;
                }
            }
            116 => {
                cursor.read_buf()?;
            }
            _ => return Err(ReadError::UnexpectedValue),
        }
        Ok(())
    }

    fn id(cursor: &mut Cursor<'_>) -> Result<(), ReadError> {
        let _client: u32 = cursor.read_var()?;
        let _clock: u32 = cursor.read_var()?;
        Ok(())
    }

    fn string(cursor: &mut Cursor<'_>) -> Result<(), ReadError> {
        std::str::from_utf8(cursor.read_buf()?)
            .map(|_| ())
            .map_err(|e| ReadError::Custom(format!("invalid UTF-8 in string: {e}")))
    }

    fn unsupported(what: &str) -> ReadError {
        ReadError::Custom(format!("unsupported {what}"))
    }
}

/// Mergeable rich-text document state.
pub struct Replica {
    doc: Doc,
    content: TextRef,
}

impl Replica {
    /// Create a replica with no content.
    pub fn new() -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_FIELD);
        Self { doc, content }
    }

    /// Reconstruct a replica from a full-state snapshot.
    pub fn hydrate(snapshot: &[u8]) -> Result<Self, ReplicaError> {
        let update = decode_update(snapshot)
            .map_err(|e| ReplicaError::CorruptSnapshot(e.to_string()))?;
        let replica = Self::new();
        {
            let mut txn = replica.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ReplicaError::CorruptSnapshot(e.to_string()))?;
        }
        Ok(replica)
    }

    /// Merge a remote delta.
    ///
    /// Duplicate and out-of-order deltas are safe. A delta that fails to
    /// decode leaves the replica untouched.
    pub fn apply_delta(&self, delta: &[u8]) -> Result<(), ReplicaError> {
        let update =
            decode_update(delta).map_err(|e| ReplicaError::MalformedDelta(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::MalformedDelta(e.to_string()))
    }

    /// Encode the complete current state.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode this replica's state vector (what it has already seen).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything this replica has that a peer with `state_vector` lacks.
    pub fn encode_delta_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Everything this replica has that the holder of `peer_state` (a full
    /// state) lacks. `None` if the peer is already up to date.
    pub fn delta_for_peer(&self, peer_state: &[u8]) -> Result<Option<Vec<u8>>, ReplicaError> {
        let peer = Self::hydrate(peer_state)?;
        let delta = self.encode_delta_since(&peer.state_vector())?;
        Ok((!is_noop(&delta)).then_some(delta))
    }

    // ─── Local edits ────────────────────────────────────────────────
    //
    // Each helper returns the delta it produced, ready to send to the relay.

    /// Insert plain text at `index` (counted in characters of rendered text).
    pub fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        self.edit(|text, txn| text.insert(txn, index, chunk))
    }

    /// Insert text carrying formatting marks.
    pub fn insert_formatted(&self, index: u32, chunk: &str, attrs: Attrs) -> Vec<u8> {
        self.edit(|text, txn| text.insert_with_attributes(txn, index, chunk, attrs))
    }

    /// Append plain text at the end of the content.
    pub fn append(&self, chunk: &str) -> Vec<u8> {
        self.edit(|text, txn| {
            let end = text.len(&*txn);
            text.insert(txn, end, chunk);
        })
    }

    /// Apply formatting marks to an existing range.
    pub fn format(&self, index: u32, len: u32, attrs: Attrs) -> Vec<u8> {
        self.edit(|text, txn| text.format(txn, index, len, attrs))
    }

    /// Remove `len` characters starting at `index`.
    pub fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        self.edit(|text, txn| text.remove_range(txn, index, len))
    }

    fn edit<F>(&self, f: F) -> Vec<u8>
    where
        F: FnOnce(&TextRef, &mut yrs::TransactionMut),
    {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            f(&self.content, &mut txn);
        }
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&before)
    }

    // ─── Rendering ──────────────────────────────────────────────────

    /// Plain-text rendering of the content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Length of the content in characters.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    /// Formatted rendering: consecutive runs with their marks.
    pub fn runs(&self) -> Vec<TextRun> {
        let txn = self.doc.transact();
        self.content
            .diff(&txn, YChange::identity)
            .into_iter()
            .map(|Diff { insert, attributes, .. }| TextRun {
                text: insert.to_string(&txn),
                marks: attributes.map(|a| *a).unwrap_or_default(),
            })
            .collect()
    }

    /// Whether the replica holds no content.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica").field("text", &self.text()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica_from(other: &Replica) -> Replica {
        Replica::hydrate(&other.encode_full_state()).unwrap()
    }

    #[test]
    fn test_empty_replica() {
        let replica = Replica::new();
        assert!(replica.is_empty());
        assert_eq!(replica.text(), "");
        assert!(replica.runs().is_empty());
    }

    #[test]
    fn test_insert_returns_applicable_delta() {
        let a = Replica::new();
        let b = Replica::new();
        let delta = a.insert(0, "Hello");
        b.apply_delta(&delta).unwrap();
        assert_eq!(b.text(), "Hello");
    }

    #[test]
    fn test_hydrate_from_full_state() {
        let a = Replica::new();
        a.insert(0, "Hello");
        a.append(" World");
        let b = replica_from(&a);
        assert_eq!(b.text(), "Hello World");
    }

    #[test]
    fn test_hydrate_corrupt_snapshot() {
        let err = Replica::hydrate(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ReplicaError::CorruptSnapshot(_)));
    }

    #[test]
    fn test_malformed_delta_leaves_state_untouched() {
        let a = Replica::new();
        a.insert(0, "keep");
        let err = a.apply_delta(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedDelta(_)));
        assert_eq!(a.text(), "keep");
    }

    /// A one-block update whose string payload ends in a lone continuation
    /// byte.
    const INVALID_UTF8_UPDATE: [u8; 23] = [
        1, 1, 189, 164, 164, 128, 7, 5, 132, 82, 164, 164, 128, 7, 4, 6, 32, 87, 156, 114, 108,
        100, 0,
    ];

    #[test]
    fn test_invalid_utf8_delta_is_rejected() {
        let a = Replica::new();
        a.insert(0, "keep");
        let err = a.apply_delta(&INVALID_UTF8_UPDATE).unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedDelta(_)), "got {err:?}");
        assert_eq!(a.text(), "keep");
        assert!(!is_noop(&INVALID_UTF8_UPDATE));
    }

    #[test]
    fn test_invalid_utf8_snapshot_is_corrupt() {
        let err = Replica::hydrate(&INVALID_UTF8_UPDATE).unwrap_err();
        assert!(matches!(err, ReplicaError::CorruptSnapshot(_)), "got {err:?}");
    }

    #[test]
    fn test_invalid_utf8_in_format_key_is_rejected() {
        let a = Replica::new();
        a.insert(0, "styled");
        let mut delta = a.format(0, 6, marks(&[("bold", Any::Bool(true))]));
        let key = delta
            .windows(4)
            .position(|w| w == b"bold")
            .expect("format key present");
        delta[key] = 0xC0;

        let b = replica_from(&a);
        let err = b.apply_delta(&delta).unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedDelta(_)), "got {err:?}");
    }

    /// Deterministic xorshift so corruptions are reproducible.
    struct Flipper(u64);

    impl Flipper {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        /// Copy of `bytes` with one or two bytes xor-ed with a nonzero mask.
        fn corrupt(&mut self, bytes: &[u8]) -> Vec<u8> {
            let mut out = bytes.to_vec();
            let flips = 1 + (self.next() % 2) as usize;
            for _ in 0..flips {
                let at = (self.next() % out.len() as u64) as usize;
                out[at] ^= (self.next() % 255 + 1) as u8;
            }
            out
        }
    }

    #[test]
    fn test_byte_flipped_updates_never_abort() {
        let author = Replica::new();
        let mut deltas = vec![
            author.insert(0, "Grüße, 世界 👋"),
            author.insert_formatted(0, "Title\n", marks(&[("heading", Any::Number(1.0))])),
            author.format(7, 5, marks(&[("bold", Any::Bool(true))])),
            author.remove(2, 3),
        ];
        let snapshot = author.encode_full_state();
        deltas.push(snapshot.clone());

        let mut flipper = Flipper(0x9E37_79B9_7F4A_7C15);
        for input in &deltas {
            for _ in 0..500 {
                let corrupted = flipper.corrupt(input);
                let target = Replica::new();
                let _ = target.apply_delta(&corrupted);
                let _ = target.runs();
                if let Ok(replica) = Replica::hydrate(&corrupted) {
                    let _ = replica.runs();
                }
            }
        }

        // The author is unaffected and still replicates cleanly.
        let copy = Replica::hydrate(&snapshot).unwrap();
        assert_eq!(copy.runs(), author.runs());
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut all = Vec::new();
        for rest in permutations(n - 1) {
            for at in 0..=rest.len() {
                let mut order = rest.clone();
                order.insert(at, n - 1);
                all.push(order);
            }
        }
        all
    }

    #[test]
    fn test_every_delivery_order_converges() {
        let base = Replica::new();
        base.insert(0, "Hello brave new World");
        let snapshot = base.encode_full_state();

        // Edits touch disjoint anchors so the merged rendering is fixed.
        let x = replica_from(&base);
        let y = replica_from(&base);
        let z = replica_from(&base);
        let deltas = [
            x.insert(0, "Say: "),
            y.format(6, 5, marks(&[("bold", Any::Bool(true))])),
            z.remove(11, 4),
            z.append("!"),
        ];

        let orders = permutations(deltas.len());
        assert_eq!(orders.len(), 24);
        let mut rendered = Vec::new();
        for order in &orders {
            let replica = Replica::hydrate(&snapshot).unwrap();
            for &i in order {
                replica.apply_delta(&deltas[i]).unwrap();
            }
            rendered.push(replica.runs());
        }

        let first = &rendered[0];
        assert!(rendered.iter().all(|runs| runs == first));
        let text: String = first.iter().map(|run| run.text.as_str()).collect();
        assert_eq!(text, "Say: Hello brave World!");
        let bold = first.iter().find(|run| run.text == "brave").expect("bold run");
        assert_eq!(bold.marks.get("bold"), Some(&Any::Bool(true)));
    }

    #[test]
    fn test_duplicate_delta_is_idempotent() {
        let a = Replica::new();
        let b = Replica::new();
        let delta = a.insert(0, "once");
        b.apply_delta(&delta).unwrap();
        let after_once = b.text();
        b.apply_delta(&delta).unwrap();
        assert_eq!(b.text(), after_once);
        assert_eq!(b.text(), "once");
    }

    #[test]
    fn test_out_of_order_deltas_converge() {
        let author = Replica::new();
        let d1 = author.insert(0, "abc");
        let d2 = author.append("def");
        let d3 = author.insert(0, ">");

        let reader = Replica::new();
        reader.apply_delta(&d3).unwrap();
        reader.apply_delta(&d2).unwrap();
        assert_eq!(reader.text(), "", "dependent deltas wait for their causes");
        reader.apply_delta(&d1).unwrap();
        assert_eq!(reader.text(), author.text());
    }

    #[test]
    fn test_concurrent_inserts_at_different_positions() {
        let base = Replica::new();
        base.insert(0, "Hello World");

        let x = replica_from(&base);
        let y = replica_from(&base);
        let dx = x.insert(0, "Say: ");
        let dy = y.append("!");

        x.apply_delta(&dy).unwrap();
        y.apply_delta(&dx).unwrap();
        assert_eq!(x.text(), "Say: Hello World!");
        assert_eq!(x.text(), y.text());
    }

    #[test]
    fn test_concurrent_inserts_at_same_position_keep_both() {
        let base = Replica::new();
        base.insert(0, "[]");

        let x = replica_from(&base);
        let y = replica_from(&base);
        let dx = x.insert(1, "x");
        let dy = y.insert(1, "y");

        x.apply_delta(&dy).unwrap();
        y.apply_delta(&dx).unwrap();
        let merged = x.text();
        assert_eq!(merged, y.text());
        assert!(merged == "[xy]" || merged == "[yx]", "got {merged}");
    }

    #[test]
    fn test_encode_delta_since_state_vector() {
        let a = Replica::new();
        a.insert(0, "first");
        let b = replica_from(&a);
        let sv = b.state_vector();
        a.append(" second");

        let diff = a.encode_delta_since(&sv).unwrap();
        b.apply_delta(&diff).unwrap();
        assert_eq!(b.text(), "first second");
    }

    #[test]
    fn test_encode_delta_since_rejects_garbage() {
        let a = Replica::new();
        let err = a.encode_delta_since(&[0xFF]).unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedStateVector(_)));
    }

    #[test]
    fn test_delta_for_peer() {
        let server = Replica::new();
        server.insert(0, "shared");
        let offline = replica_from(&server);
        assert_eq!(offline.delta_for_peer(&server.encode_full_state()).unwrap(), None);

        offline.append(" edit");
        let delta = offline
            .delta_for_peer(&server.encode_full_state())
            .unwrap()
            .expect("offline edit must be sent");
        server.apply_delta(&delta).unwrap();
        assert_eq!(server.text(), "shared edit");
    }

    #[test]
    fn test_formatting_marks_replicate() {
        let a = Replica::new();
        a.insert(0, "plain ");
        a.insert_formatted(6, "bold", marks(&[("bold", Any::Bool(true))]));

        let b = replica_from(&a);
        let runs = b.runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].text, "plain ");
        assert!(runs[0].marks.is_empty());
        assert_eq!(runs[1].text, "bold");
        assert_eq!(runs[1].marks.get("bold"), Some(&Any::Bool(true)));
    }

    #[test]
    fn test_format_and_remove() {
        let a = Replica::new();
        a.insert(0, "Hello World");
        a.format(0, 5, marks(&[("italic", Any::Bool(true))]));
        a.remove(5, 6);
        assert_eq!(a.text(), "Hello");
        assert_eq!(a.runs()[0].marks.get("italic"), Some(&Any::Bool(true)));
    }
}
