//! Candidate producers.
//!
//! Every source runs independently (stdin reader thread, periodic hub
//! scanner, one-off export scan) and pushes into the same
//! [`CandidateFunnel`]. The supervisor is the single consumer.

pub mod export;
pub mod hub;
pub mod paste;

use std::sync::mpsc::{self, Receiver, Sender};

use tracing::{debug, warn};

use crate::candidate::CodeCandidate;

/// Unchecked input from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub bytes: Vec<u8>,
    pub provenance: String,
}

impl RawCandidate {
    pub fn new(bytes: impl Into<Vec<u8>>, provenance: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            provenance: provenance.into(),
        }
    }
}

/// Sending half of the supervisor's queue. Cheap to clone, one per source.
#[derive(Debug, Clone)]
pub struct CandidateFunnel {
    tx: Sender<CodeCandidate>,
}

/// Create the single-consumer candidate queue.
pub fn channel() -> (CandidateFunnel, Receiver<CodeCandidate>) {
    let (tx, rx) = mpsc::channel();
    (CandidateFunnel { tx }, rx)
}

/// Why [`CandidateFunnel::offer`] did not enqueue a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    /// Empty or non-text input; dropped before reaching the supervisor.
    Malformed,
    /// The supervisor has stopped consuming.
    Closed,
}

impl CandidateFunnel {
    /// Normalize `raw` and enqueue it.
    pub fn offer(&self, raw: RawCandidate) -> Result<(), OfferError> {
        let candidate = match CodeCandidate::from_bytes(raw.bytes, raw.provenance) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(err = %err, "dropping malformed candidate");
                return Err(OfferError::Malformed);
            }
        };
        debug!(provenance = %candidate.provenance(), bytes = candidate.payload().len(), "candidate queued");
        self.tx.send(candidate).map_err(|_| OfferError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_candidates_never_reach_the_queue() {
        let (funnel, rx) = channel();

        assert_eq!(
            funnel.offer(RawCandidate::new("  \n", "paste")),
            Err(OfferError::Malformed)
        );
        assert_eq!(
            funnel.offer(RawCandidate::new(vec![0xff, 0x00], "hub:bin")),
            Err(OfferError::Malformed)
        );
        funnel
            .offer(RawCandidate::new("echo ok\n", "paste"))
            .expect("offer");
        drop(funnel);

        let queued: Vec<CodeCandidate> = rx.iter().collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload(), "echo ok\n");
    }

    #[test]
    fn offer_after_consumer_drops_reports_closed() {
        let (funnel, rx) = channel();
        drop(rx);
        assert_eq!(
            funnel.offer(RawCandidate::new("x = 1", "paste")),
            Err(OfferError::Closed)
        );
    }

    #[test]
    fn clones_feed_the_same_consumer() {
        let (funnel, rx) = channel();
        let other = funnel.clone();
        let handle = std::thread::spawn(move || {
            other
                .offer(RawCandidate::new("from thread", "hub:a"))
                .expect("offer");
        });
        funnel
            .offer(RawCandidate::new("from main", "paste"))
            .expect("offer");
        handle.join().expect("join");
        drop(funnel);

        let mut payloads: Vec<String> = rx.iter().map(|c| c.payload().to_string()).collect();
        payloads.sort();
        assert_eq!(payloads, vec!["from main", "from thread"]);
    }
}
