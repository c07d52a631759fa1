//! Per-job progress channel: ordered multi-subscriber broadcast with
//! replay.
//!
//! Subscribers joining mid-run receive the full event prefix then live
//! events; joining after the terminal transition yields one synthetic
//! final event. Slow consumers observe a sequence gap (the broadcast
//! buffer drops the oldest undelivered events) and refresh by polling
//! status.

use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::models::progress::{JobState, ProgressEvent};

/// Broadcast buffer per subscriber before the drop-oldest policy kicks in.
const SUBSCRIBER_BUFFER: usize = 256;

struct Inner {
    history: Vec<ProgressEvent>,
    sender: Option<broadcast::Sender<ProgressEvent>>,
    last_percent: u8,
}

pub struct ProgressChannel {
    inner: Mutex<Inner>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            inner: Mutex::new(Inner {
                history: Vec::new(),
                sender: Some(sender),
                last_percent: 0,
            }),
        }
    }

    /// Publish a non-terminal event. Sequence and percentage are
    /// monotonic; a percentage below the last one is clamped up.
    pub fn publish(&self, percent: u8, status: &str, substep: Option<String>) -> ProgressEvent {
        self.push(percent, status, substep, false, None)
    }

    /// Publish the terminal event and close the channel. Idempotent: a
    /// second terminal publish is ignored.
    pub fn publish_terminal(&self, state: JobState, status: &str) -> Option<ProgressEvent> {
        {
            let inner = self.inner.lock().expect("progress channel poisoned");
            if inner.history.last().is_some_and(|e| e.terminal) {
                return None;
            }
        }
        let percent = if state == JobState::Succeeded { 100 } else { 0 };
        let event = self.push(percent, status, None, true, Some(state));
        self.close();
        Some(event)
    }

    fn push(
        &self,
        percent: u8,
        status: &str,
        substep: Option<String>,
        terminal: bool,
        state: Option<JobState>,
    ) -> ProgressEvent {
        let mut inner = self.inner.lock().expect("progress channel poisoned");
        let percent = percent.clamp(inner.last_percent, 100);
        inner.last_percent = percent;
        let event = ProgressEvent {
            seq: inner.history.len() as u64,
            percent,
            status: status.to_string(),
            substep,
            terminal,
            state,
        };
        inner.history.push(event.clone());
        if let Some(sender) = &inner.sender {
            // A send error only means no subscriber is listening right now;
            // the event stays in history for replay.
            let _ = sender.send(event.clone());
        }
        event
    }

    /// Close the channel: live streams end once their backlog drains.
    /// Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("progress channel poisoned");
        inner.sender = None;
    }

    /// Subscribe: events already published with `seq > after_seq` are
    /// replayed, and a live receiver is returned while the job runs. After
    /// the terminal transition the replay collapses to the single final
    /// event and no receiver is returned.
    pub fn subscribe(
        &self,
        after_seq: Option<u64>,
    ) -> (Vec<ProgressEvent>, Option<broadcast::Receiver<ProgressEvent>>) {
        let inner = self.inner.lock().expect("progress channel poisoned");
        match &inner.sender {
            Some(sender) => {
                let receiver = sender.subscribe();
                let replay = inner
                    .history
                    .iter()
                    .filter(|e| after_seq.map_or(true, |seq| e.seq > seq))
                    .cloned()
                    .collect();
                (replay, Some(receiver))
            }
            None => {
                let replay = inner.history.last().cloned().into_iter().collect();
                (replay, None)
            }
        }
    }

    pub fn last_event(&self) -> Option<ProgressEvent> {
        let inner = self.inner.lock().expect("progress channel poisoned");
        inner.history.last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_strictly_increasing() {
        let channel = ProgressChannel::new();
        for i in 0..5 {
            channel.publish(i * 10, "stage", None);
        }
        let (replay, receiver) = channel.subscribe(None);
        assert!(receiver.is_some());
        let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn percent_is_monotonic() {
        let channel = ProgressChannel::new();
        channel.publish(40, "warehouse-execute", None);
        let event = channel.publish(10, "aggregate", None);
        assert_eq!(event.percent, 40);
    }

    #[tokio::test]
    async fn live_subscriber_sees_replay_then_new_events() {
        let channel = ProgressChannel::new();
        channel.publish(5, "validate", None);
        channel.publish(10, "build-query", None);

        let (replay, receiver) = channel.subscribe(None);
        assert_eq!(replay.len(), 2);
        let mut receiver = receiver.unwrap();

        channel.publish(40, "warehouse-execute", None);
        let live = receiver.recv().await.unwrap();
        assert_eq!(live.seq, 2);
        assert_eq!(live.status, "warehouse-execute");
    }

    #[test]
    fn terminal_subscribe_yields_single_final_event() {
        let channel = ProgressChannel::new();
        channel.publish(5, "validate", None);
        channel.publish(40, "warehouse-execute", None);
        channel.publish_terminal(JobState::Succeeded, "succeeded");

        let (replay, receiver) = channel.subscribe(None);
        assert!(receiver.is_none());
        assert_eq!(replay.len(), 1);
        assert!(replay[0].terminal);
        assert_eq!(replay[0].state, Some(JobState::Succeeded));
        assert_eq!(replay[0].percent, 100);
    }

    #[test]
    fn terminal_publish_is_idempotent() {
        let channel = ProgressChannel::new();
        assert!(channel.publish_terminal(JobState::Failed, "boom").is_some());
        assert!(channel.publish_terminal(JobState::Failed, "boom").is_none());
        assert_eq!(channel.last_event().unwrap().seq, 0);
    }

    #[test]
    fn failed_terminal_keeps_last_percent() {
        let channel = ProgressChannel::new();
        channel.publish(55, "aggregate", None);
        let event = channel.publish_terminal(JobState::Failed, "timeout").unwrap();
        assert_eq!(event.percent, 55);
        assert_eq!(event.state, Some(JobState::Failed));
    }

    #[test]
    fn replay_honors_last_event_id() {
        let channel = ProgressChannel::new();
        for i in 0..5 {
            channel.publish(i * 10, "stage", None);
        }
        let (replay, _) = channel.subscribe(Some(2));
        let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn closing_ends_live_streams_after_backlog() {
        let channel = ProgressChannel::new();
        let (_, receiver) = channel.subscribe(None);
        let mut receiver = receiver.unwrap();
        channel.publish(10, "build-query", None);
        channel.publish_terminal(JobState::Succeeded, "succeeded");

        assert_eq!(receiver.recv().await.unwrap().seq, 0);
        let terminal = receiver.recv().await.unwrap();
        assert!(terminal.terminal);
        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
