//! Outbound message ordering: msgSerial assignment and ACK/NACK correlation.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::error::{ErrorInfo, error_code};
use crate::protocol::{ProtocolMessage, PublishResult};

pub(crate) type AckResult = Result<PublishResult, ErrorInfo>;

/// The caller-side halves of one publish: notified once written, then once
/// the service acknowledges or rejects it.
#[derive(Default)]
pub(crate) struct Completion {
    pub(crate) sent: Option<oneshot::Sender<()>>,
    pub(crate) ack: Option<oneshot::Sender<AckResult>>,
}

impl Completion {
    pub(crate) fn ack_only(ack: oneshot::Sender<AckResult>) -> Self {
        Self {
            sent: None,
            ack: Some(ack),
        }
    }
}

pub(crate) struct QueuedMessage {
    pub(crate) msg: ProtocolMessage,
    completions: Vec<Completion>,
}

impl QueuedMessage {
    pub(crate) fn new(msg: ProtocolMessage, completion: Completion) -> Self {
        Self {
            msg,
            completions: vec![completion],
        }
    }

    pub(crate) fn channel(&self) -> Option<&str> {
        self.msg.channel.as_deref()
    }

    fn notify_sent(&mut self) {
        for completion in &mut self.completions {
            if let Some(sent) = completion.sent.take() {
                let _ = sent.send(());
            }
        }
    }

    pub(crate) fn complete(self, result: AckResult) {
        for completion in self.completions {
            if let Some(ack) = completion.ack {
                let _ = ack.send(result.clone());
            }
        }
    }
}

pub(crate) struct SendQueue {
    msg_serial: i64,
    pending_start_serial: i64,
    /// Written and awaiting ACK/NACK, ascending msgSerial without gaps.
    pending: VecDeque<QueuedMessage>,
    /// Not yet written, in enqueue order.
    queued: VecDeque<QueuedMessage>,
}

impl SendQueue {
    pub(crate) fn new(msg_serial: i64) -> Self {
        Self {
            msg_serial,
            pending_start_serial: msg_serial,
            pending: VecDeque::new(),
            queued: VecDeque::new(),
        }
    }

    pub(crate) fn msg_serial(&self) -> i64 {
        self.msg_serial
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queued.len()
    }

    #[cfg(test)]
    fn pending_start_serial(&self) -> i64 {
        self.pending_start_serial
    }

    /// Hold a message until it can be written, merging it into the tail entry
    /// when both fit in one frame.
    pub(crate) fn enqueue(&mut self, mut qm: QueuedMessage, max_message_size: usize) {
        if let Some(tail) = self.queued.back_mut()
            && tail.msg.merge_from(&qm.msg, max_message_size)
        {
            tail.completions.append(&mut qm.completions);
            return;
        }
        self.queued.push_back(qm);
    }

    /// Assign the next msgSerial (for ack-bearing actions), move the message
    /// to pending and return the copy to write to the transport.
    pub(crate) fn send(&mut self, mut qm: QueuedMessage) -> ProtocolMessage {
        if qm.msg.ack_required() {
            let serial = self.msg_serial;
            self.msg_serial += 1;
            if self.pending.is_empty() {
                self.pending_start_serial = serial;
            }
            qm.msg.msg_serial = Some(serial);
            qm.notify_sent();
            let wire = qm.msg.clone();
            self.pending.push_back(qm);
            wire
        } else {
            qm.notify_sent();
            let wire = qm.msg.clone();
            qm.complete(Ok(PublishResult::default()));
            wire
        }
    }

    /// Remove and return the queued entries for `channel`, in enqueue order.
    pub(crate) fn take_queued(&mut self, channel: &str) -> Vec<QueuedMessage> {
        let (mine, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.queued)
            .into_iter()
            .partition(|qm| qm.channel() == Some(channel));
        self.queued = rest;
        mine.into()
    }

    /// Split the pending list for an ACK/NACK addressing `[serial, serial + count)`.
    /// Returns `(skipped, addressed)`: entries older than `serial` that the
    /// service jumped over, then the entries the reply is about.
    fn take_range(
        &mut self,
        serial: i64,
        count: i64,
    ) -> (Vec<QueuedMessage>, Vec<QueuedMessage>) {
        let mut serial = serial;
        let mut count = count.max(0);

        if serial < self.pending_start_serial {
            // Part of the range was already resolved.
            count = (count - (self.pending_start_serial - serial)).max(0);
            serial = self.pending_start_serial;
        }

        let mut skipped = Vec::new();
        if serial > self.pending_start_serial {
            let gap = usize::try_from(serial - self.pending_start_serial)
                .unwrap_or(usize::MAX)
                .min(self.pending.len());
            skipped = self.pending.drain(..gap).collect();
            self.pending_start_serial = serial;
        }

        let n = usize::try_from(count)
            .unwrap_or(usize::MAX)
            .min(self.pending.len());
        let addressed = self.pending.drain(..n).collect();
        self.pending_start_serial = serial + count;
        (skipped, addressed)
    }

    pub(crate) fn ack(&mut self, serial: i64, count: i64, results: Option<Vec<PublishResult>>) {
        let (skipped, addressed) = self.take_range(serial, count);
        fail_skipped(skipped, serial);
        let results = results.unwrap_or_default();
        for (i, qm) in addressed.into_iter().enumerate() {
            let result = results.get(i).cloned().unwrap_or_default();
            qm.complete(Ok(result));
        }
    }

    pub(crate) fn nack(&mut self, serial: i64, count: i64, error: ErrorInfo) {
        let (skipped, addressed) = self.take_range(serial, count);
        fail_skipped(skipped, serial);
        for qm in addressed {
            qm.complete(Err(error.clone()));
        }
    }

    /// After a reconnect without continuity the service has forgotten the
    /// old numbering: pending entries go back to the head of the queue and
    /// numbering restarts at `next_serial`.
    pub(crate) fn requeue_pending(&mut self, next_serial: i64) {
        while let Some(mut qm) = self.pending.pop_back() {
            qm.msg.msg_serial = None;
            self.queued.push_front(qm);
        }
        self.msg_serial = next_serial;
        self.pending_start_serial = next_serial;
    }

    pub(crate) fn fail_queued(&mut self, error: &ErrorInfo) {
        for qm in self.queued.drain(..) {
            qm.complete(Err(error.clone()));
        }
    }

    pub(crate) fn fail_all(&mut self, error: &ErrorInfo) {
        for qm in self.pending.drain(..) {
            qm.complete(Err(error.clone()));
        }
        self.pending_start_serial = self.msg_serial;
        self.fail_queued(error);
    }

    pub(crate) fn fail_channel(&mut self, channel: &str, error: &ErrorInfo) {
        for qm in self.take_queued(channel) {
            qm.complete(Err(error.clone()));
        }
    }
}

fn fail_skipped(skipped: Vec<QueuedMessage>, serial: i64) {
    if skipped.is_empty() {
        return;
    }
    tracing::warn!(
        count = skipped.len(),
        serial,
        "Reply skipped pending messages, failing them"
    );
    let error = ErrorInfo::new(
        error_code::INTERNAL,
        Some(500),
        "message was not acknowledged by the service",
    );
    for qm in skipped {
        qm.complete(Err(error.clone()));
    }
}
