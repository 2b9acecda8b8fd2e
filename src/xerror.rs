//! X error filtering.
//!
//! Requests expected to fail (operations racing window destruction) have
//! their sequence numbers queued here; an error whose sequence matches a
//! queued entry is dropped silently. Errors carry truncated 16-bit sequence
//! numbers, so matching uses wrapping distance with a half-range window.

use std::collections::VecDeque;

use tracing::{trace, warn};
use x11rb::protocol::ErrorKind;
use x11rb::x11_utils::X11Error;

#[derive(Debug, Default)]
pub struct ErrorFilter {
    ignores: VecDeque<u16>,
}

impl ErrorFilter {
    /// Expect the request with this sequence number to fail.
    pub fn ignore(&mut self, sequence: u64) {
        self.ignores.push_back(sequence as u16);
    }

    /// Check an incoming error against the queue, discarding entries that
    /// are already in the past.
    pub fn should_ignore(&mut self, sequence: u16) -> bool {
        while let Some(&front) = self.ignores.front() {
            let distance = sequence.wrapping_sub(front);
            if distance == 0 {
                return true;
            }
            if distance < u16::MAX / 2 {
                // The queued request is older than this error.
                self.ignores.pop_front();
            } else {
                break;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.ignores.len()
    }

    /// Log (or swallow) an X error event.
    pub fn handle(&mut self, err: &X11Error) {
        if self.should_ignore(err.sequence) {
            trace!("Ignoring expected X error seq {}", err.sequence);
            return;
        }
        match err.error_kind {
            // Routine fallout of windows dying under us.
            ErrorKind::Window | ErrorKind::Drawable | ErrorKind::Match
            | ErrorKind::DamageBadDamage => {
                trace!(
                    "X error (likely destroyed window): {:?} major {} minor {} seq {}",
                    err.error_kind, err.major_opcode, err.minor_opcode, err.sequence
                );
            }
            _ => {
                warn!(
                    "X error: {:?} code {} major {} minor {} bad value {:#x} seq {}",
                    err.error_kind,
                    err.error_code,
                    err.major_opcode,
                    err.minor_opcode,
                    err.bad_value,
                    err.sequence
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_sequence_is_ignored_once_relevant() {
        let mut f = ErrorFilter::default();
        f.ignore(100);
        f.ignore(105);
        assert!(f.should_ignore(100));
        assert!(f.should_ignore(105));
        assert!(!f.should_ignore(106));
    }

    #[test]
    fn stale_entries_are_discarded() {
        let mut f = ErrorFilter::default();
        f.ignore(10);
        f.ignore(20);
        // An error from sequence 15 discards the 10 entry but keeps 20.
        assert!(!f.should_ignore(15));
        assert_eq!(f.len(), 1);
        assert!(f.should_ignore(20));
    }

    #[test]
    fn sequence_wraparound_is_handled() {
        let mut f = ErrorFilter::default();
        // A request queued just before the 16-bit wrap counts as "in the
        // past" for an error that arrives just after the wrap.
        f.ignore(0xFFFE);
        assert!(!f.should_ignore(2));
        assert_eq!(f.len(), 0);
        // And an error from just before the wrap does not flush a fresh
        // post-wrap entry.
        f.ignore(1);
        assert!(!f.should_ignore(0xFFF0));
        assert_eq!(f.len(), 1);
        assert!(f.should_ignore(1));
    }
}
