// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::DiagnosticMessage;
use crate::channel::{ChannelEndpoint, ChannelIdentity};
use crate::shared::handshake::HandshakeLink;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("Failed to query the channel for a pending message")]
    Query(#[source] io::Error),
    #[error("Failed to read a pending message")]
    Read(#[source] io::Error),
}

#[derive(Debug)]
pub enum DrainOutcome {
    /// Every pending message was read.
    Complete,
    /// Reading stopped early.  The messages read before the failure are still reported.
    Failed(DrainError),
}

#[derive(Debug)]
pub struct DrainReport {
    pub messages: Vec<DiagnosticMessage>,
    pub outcome: DrainOutcome,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, DrainOutcome::Complete)
    }
}

/// The receive side of a channel as seen by a drain.
pub(crate) trait MessageSource {
    fn identity(&self) -> &ChannelIdentity;
    fn reset_signal(&self) -> io::Result<()>;
    /// Size of the oldest pending message, `None` when the queue is empty.
    fn next_message_size(&self) -> io::Result<Option<usize>>;
    fn read_message(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl MessageSource for ChannelEndpoint {
    fn identity(&self) -> &ChannelIdentity {
        ChannelEndpoint::identity(self)
    }

    fn reset_signal(&self) -> io::Result<()> {
        ChannelEndpoint::reset_signal(self)
    }

    fn next_message_size(&self) -> io::Result<Option<usize>> {
        ChannelEndpoint::next_message_size(self)
    }

    fn read_message(&self, buf: &mut [u8]) -> io::Result<usize> {
        ChannelEndpoint::read_message(self, buf)
    }
}

/// Pending messages of a channel, oldest first.  Stops after the queue is empty or after the
/// first error.
pub struct Drain<'a> {
    source: &'a dyn MessageSource,
    finished: bool,
}

impl<'a> Drain<'a> {
    fn new(source: &'a dyn MessageSource) -> Self {
        Self {
            source,
            finished: false,
        }
    }

    fn fail(&mut self, error: DrainError) -> Option<Result<DiagnosticMessage, DrainError>> {
        self.finished = true;
        Some(Err(error))
    }
}

impl Iterator for Drain<'_> {
    type Item = Result<DiagnosticMessage, DrainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let size = match self.source.next_message_size() {
            Ok(Some(size)) => size,
            Ok(None) => {
                self.finished = true;
                return None;
            }
            Err(e) => return self.fail(DrainError::Query(e)),
        };
        let mut bytes = vec![0u8; size];
        match self.source.read_message(&mut bytes) {
            Ok(read) => {
                bytes.truncate(read);
                Some(Ok(DiagnosticMessage::new(bytes)))
            }
            Err(e) => self.fail(DrainError::Read(e)),
        }
    }
}

impl std::iter::FusedIterator for Drain<'_> {}

impl ChannelEndpoint {
    /// Reads pending messages without blocking.
    pub fn messages(&self) -> Drain<'_> {
        Drain::new(self)
    }
}

/// Collects whatever the worker left in the channel, then releases the channel and clears the
/// handshake link.  Never blocks waiting for a message.
pub fn drain(endpoint: ChannelEndpoint, link: &HandshakeLink) -> DrainReport {
    let report = collect(&endpoint);
    endpoint.close();
    link.clear();
    report
}

/// Resets the signal, then reads every pending message.
fn collect(source: &dyn MessageSource) -> DrainReport {
    let channel = source.identity();
    if let Err(e) = source.reset_signal() {
        tracing::warn!(%channel, error = %e, "Failed to reset the diagnostic signal");
    }

    let mut messages = vec![];
    let mut outcome = DrainOutcome::Complete;
    for message in Drain::new(source) {
        match message {
            Ok(message) => messages.push(message),
            Err(e) => {
                tracing::warn!(%channel, error = ?e, "Diagnostic drain stopped early");
                outcome = DrainOutcome::Failed(e);
            }
        }
    }
    tracing::debug!(
        %channel,
        count = messages.len(),
        "Drained diagnostic channel"
    );
    DrainReport { messages, outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::test_prefix;
    use crate::channel::{sys, ChannelNamespace};
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn published(test: &str) -> (ChannelEndpoint, HandshakeLink) {
        let endpoint =
            ChannelEndpoint::create(&test_prefix(test), &ChannelNamespace::Default).unwrap();
        let link = HandshakeLink::new();
        link.publish(endpoint.worker_ids());
        (endpoint, link)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_empty_channel() {
        let (endpoint, link) = published("drain-empty");
        let report = drain(endpoint, &link);
        assert!(report.is_complete());
        assert!(report.messages.is_empty());
        assert!(!link.is_enabled());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_messages_in_order() {
        let (endpoint, link) = published("drain-order");
        let sender = endpoint.worker_ids().sender;
        let sent: [&[u8]; 3] = [b"one", b"", b"three"];
        for payload in sent {
            sys::send_message(sender, payload).unwrap();
        }
        sys::set_signal(endpoint.worker_ids().signal).unwrap();

        let report = drain(endpoint, &link);
        assert!(report.is_complete());
        let payloads: Vec<&[u8]> = report.messages.iter().map(|m| m.as_bytes()).collect();
        assert_eq!(payloads, sent);
        assert!(report.messages.iter().all(|m| !m.is_complete()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_iterator_is_lazy_and_fused() {
        let (endpoint, _link) = published("drain-lazy");
        let sender = endpoint.worker_ids().sender;
        sys::send_message(sender, b"first").unwrap();

        let mut messages = endpoint.messages();
        assert_eq!(messages.next().unwrap().unwrap().as_bytes(), b"first");
        assert!(messages.next().is_none());

        // Arrived after the drain finished: a fresh drain sees it, the old one does not.
        sys::send_message(sender, b"late").unwrap();
        assert!(messages.next().is_none());
        assert_eq!(endpoint.messages().count(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_collect_resets_the_signal() {
        let (endpoint, _link) = published("drain-reset");
        sys::set_signal(endpoint.worker_ids().signal).unwrap();
        assert!(endpoint.is_signaled().unwrap());

        let report = collect(&endpoint);
        assert!(report.is_complete());
        assert!(!endpoint.is_signaled().unwrap());
    }

    #[derive(Debug, PartialEq)]
    enum Call {
        Reset,
        Query,
        Read,
    }

    /// Replays scripted query results; reads fill the buffer with `len` copies of `len`.
    struct ScriptedSource {
        identity: ChannelIdentity,
        queries: RefCell<VecDeque<io::Result<Option<usize>>>>,
        fail_read: bool,
        calls: RefCell<Vec<Call>>,
    }

    impl ScriptedSource {
        fn new(queries: Vec<io::Result<Option<usize>>>, fail_read: bool) -> Self {
            Self {
                identity: ChannelIdentity::new("scripted", 1),
                queries: RefCell::new(queries.into()),
                fail_read,
                calls: RefCell::new(vec![]),
            }
        }
    }

    impl MessageSource for ScriptedSource {
        fn identity(&self) -> &ChannelIdentity {
            &self.identity
        }

        fn reset_signal(&self) -> io::Result<()> {
            self.calls.borrow_mut().push(Call::Reset);
            Ok(())
        }

        fn next_message_size(&self) -> io::Result<Option<usize>> {
            self.calls.borrow_mut().push(Call::Query);
            self.queries.borrow_mut().pop_front().unwrap_or(Ok(None))
        }

        fn read_message(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls.borrow_mut().push(Call::Read);
            if self.fail_read {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            buf.fill(buf.len() as u8);
            Ok(buf.len())
        }
    }

    #[test]
    fn test_signal_is_reset_before_the_first_query() {
        let source = ScriptedSource::new(vec![Ok(Some(2)), Ok(None)], false);
        let report = collect(&source);
        assert!(report.is_complete());
        assert_eq!(report.messages.len(), 1);
        assert_eq!(
            *source.calls.borrow(),
            vec![Call::Reset, Call::Query, Call::Read, Call::Query]
        );
    }

    #[test]
    fn test_query_failure_keeps_earlier_messages() {
        let source = ScriptedSource::new(
            vec![
                Ok(Some(3)),
                Ok(Some(1)),
                Err(io::Error::from(io::ErrorKind::PermissionDenied)),
                Ok(Some(5)),
            ],
            false,
        );
        let report = collect(&source);
        let payloads: Vec<&[u8]> = report.messages.iter().map(|m| m.as_bytes()).collect();
        assert_eq!(payloads, [&[3u8, 3, 3][..], &[1u8][..]]);
        match report.outcome {
            DrainOutcome::Failed(DrainError::Query(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // Nothing is polled after the failure.
        assert_eq!(source.queries.borrow().len(), 1);
    }

    #[test]
    fn test_read_failure_stops_the_drain() {
        let source = ScriptedSource::new(vec![Ok(Some(4)), Ok(Some(4))], true);
        let report = collect(&source);
        assert!(report.messages.is_empty());
        assert!(!report.is_complete());
        assert!(matches!(
            report.outcome,
            DrainOutcome::Failed(DrainError::Read(_))
        ));
        assert_eq!(
            *source.calls.borrow(),
            vec![Call::Reset, Call::Query, Call::Read]
        );
    }
}
