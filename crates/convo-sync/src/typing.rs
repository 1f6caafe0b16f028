//! Outbound typing indicator with an idle debounce.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use convo_core::frames::OutboundFrame;
use convo_core::ids::ConversationId;

use crate::scheduler::{TaskScheduler, TimerKind};
use crate::transport::FrameSink;

pub const TYPING_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Sends `isTyping: true` once per burst and exactly one `isTyping: false`
/// when the burst ends, either explicitly or after the idle timeout.
pub struct TypingNotifier {
    sink: Arc<dyn FrameSink>,
    scheduler: Arc<TaskScheduler>,
    idle_timeout: Duration,
    /// Conversation of the active burst.
    burst: Arc<Mutex<Option<ConversationId>>>,
}

impl TypingNotifier {
    pub fn new(sink: Arc<dyn FrameSink>, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            sink,
            scheduler,
            idle_timeout: TYPING_IDLE_TIMEOUT,
            burst: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool) {
        if !is_typing {
            let mut burst = self.burst.lock();
            if burst.as_ref() == Some(conversation_id) {
                self.scheduler.cancel(TimerKind::TypingStop);
                end_burst(&mut burst, self.sink.as_ref());
            }
            return;
        }

        {
            let mut burst = self.burst.lock();
            if burst.as_ref() != Some(conversation_id) {
                end_burst(&mut burst, self.sink.as_ref());
                trace!(conversation_id = %conversation_id, "typing started");
                self.sink
                    .send_frame(&OutboundFrame::typing(conversation_id.clone(), true));
                *burst = Some(conversation_id.clone());
            }
        }

        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(&self.burst);
        self.scheduler
            .schedule_once(TimerKind::TypingStop, self.idle_timeout, move || async move {
                end_burst(&mut state.lock(), sink.as_ref());
            });
    }

    /// End any active burst now.
    pub fn stop(&self) {
        self.scheduler.cancel(TimerKind::TypingStop);
        end_burst(&mut self.burst.lock(), self.sink.as_ref());
    }

    pub fn is_typing(&self) -> bool {
        self.burst.lock().is_some()
    }
}

fn end_burst(burst: &mut Option<ConversationId>, sink: &dyn FrameSink) {
    if let Some(conversation_id) = burst.take() {
        trace!(conversation_id = %conversation_id, "typing stopped");
        sink.send_frame(&OutboundFrame::typing(conversation_id, false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<OutboundFrame>>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &OutboundFrame) -> bool {
            self.frames.lock().push(frame.clone());
            true
        }
    }

    impl RecordingSink {
        fn typing_flags(&self) -> Vec<(String, bool)> {
            self.frames
                .lock()
                .iter()
                .map(|f| match f {
                    OutboundFrame::Typing {
                        conversation_id,
                        is_typing,
                    } => (conversation_id.to_string(), *is_typing),
                    other => panic!("unexpected frame {other:?}"),
                })
                .collect()
        }
    }

    fn notifier() -> (TypingNotifier, Arc<RecordingSink>, Arc<TaskScheduler>) {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Arc::new(TaskScheduler::new());
        let notifier = TypingNotifier::new(sink.clone(), Arc::clone(&scheduler));
        (notifier, sink, scheduler)
    }

    fn c(id: &str) -> ConversationId {
        ConversationId::from_raw(id)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_sends_exactly_one_stop() {
        let (notifier, sink, scheduler) = notifier();
        notifier.set_typing(&c("c1"), true);
        tokio::time::sleep(Duration::from_millis(2_999)).await;
        assert_eq!(sink.typing_flags(), vec![("c1".into(), true)]);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(sink.typing_flags(), vec![("c1".into(), true), ("c1".into(), false)]);
        assert!(!scheduler.is_pending(TimerKind::TypingStop));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.typing_flags().len(), 2);
        assert!(!notifier.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_extend_the_burst() {
        let (notifier, sink, _scheduler) = notifier();
        for _ in 0..5 {
            notifier.set_typing(&c("c1"), true);
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(sink.typing_flags(), vec![("c1".into(), true)]);
        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(sink.typing_flags(), vec![("c1".into(), true), ("c1".into(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_timer() {
        let (notifier, sink, scheduler) = notifier();
        notifier.set_typing(&c("c1"), true);
        notifier.set_typing(&c("c1"), false);
        assert!(!scheduler.is_pending(TimerKind::TypingStop));
        notifier.set_typing(&c("c1"), false);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.typing_flags(), vec![("c1".into(), true), ("c1".into(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_conversation_ends_previous_burst() {
        let (notifier, sink, _scheduler) = notifier();
        notifier.set_typing(&c("c1"), true);
        notifier.set_typing(&c("c2"), true);
        notifier.stop();
        assert_eq!(
            sink.typing_flags(),
            vec![
                ("c1".into(), true),
                ("c1".into(), false),
                ("c2".into(), true),
                ("c2".into(), false),
            ]
        );
    }
}
