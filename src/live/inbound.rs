//! Classification and routing of inbound messages
//!
//! Messages are consumed strictly in arrival order. Audio fragments collect
//! in a buffer that is flushed to playback once it holds
//! [`FLUSH_THRESHOLD`] fragments, or when a turn completes with anything
//! buffered. An interruption discards the buffer without flushing.

use super::protocol::{InboundMessage, ToolCallRecord};

/// Buffered fragment count that triggers a flush
pub const FLUSH_THRESHOLD: usize = 3;

/// Side effect requested by one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Overwrite the stored resumption handle
    StoreHandle(String),
    /// Tear down playback and clear the speaking flag
    Interrupt,
    /// Invoke the tool listener and acknowledge each call
    DispatchTools(Vec<ToolCallRecord>),
    /// Hand buffered fragments to the playback scheduler
    Flush(Vec<Vec<u8>>),
    /// Model text for transcript listeners
    Transcript(String),
}

/// Owns the fragment buffer for the current turn
#[derive(Debug, Default)]
pub struct InboundProcessor {
    buffer: Vec<Vec<u8>>,
}

impl InboundProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one message and return the effects to apply, in order
    pub fn process(&mut self, message: InboundMessage) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut turn_complete = false;

        match message {
            InboundMessage::ResumptionUpdate(handle) => effects.push(Effect::StoreHandle(handle)),
            InboundMessage::GoAway(time_left) => {
                tracing::info!(time_left = ?time_left, "endpoint sent go-away");
            }
            InboundMessage::Interrupted => {
                if !self.buffer.is_empty() {
                    tracing::debug!(discarded = self.buffer.len(), "discarding buffered audio");
                }
                self.buffer.clear();
                effects.push(Effect::Interrupt);
            }
            InboundMessage::ToolCall(calls) => effects.push(Effect::DispatchTools(calls)),
            InboundMessage::AudioFragment(bytes) => self.buffer.push(bytes),
            InboundMessage::ModelText(text) => effects.push(Effect::Transcript(text)),
            InboundMessage::TurnComplete => turn_complete = true,
        }

        if self.buffer.len() >= FLUSH_THRESHOLD || (turn_complete && !self.buffer.is_empty()) {
            effects.push(Effect::Flush(std::mem::take(&mut self.buffer)));
        }

        effects
    }

    /// Number of fragments awaiting flush
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered fragments
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(n: u8) -> InboundMessage {
        InboundMessage::AudioFragment(vec![n, n])
    }

    fn flushes(effects: &[Effect]) -> Vec<Vec<Vec<u8>>> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Flush(batch) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    fn feed(processor: &mut InboundProcessor, messages: Vec<InboundMessage>) -> Vec<Vec<Vec<u8>>> {
        messages
            .into_iter()
            .flat_map(|m| flushes(&processor.process(m)))
            .collect()
    }

    #[test]
    fn flushes_at_threshold() {
        for (count, expected) in [(1, 0), (2, 0), (3, 1), (4, 1)] {
            let mut processor = InboundProcessor::new();
            let batches = feed(&mut processor, (0..count).map(fragment).collect());
            assert_eq!(batches.len(), expected, "{count} fragments");
            if expected == 1 {
                assert_eq!(batches[0].len(), 3);
            }
            assert_eq!(processor.buffered(), usize::from(count) - 3 * expected);
        }
    }

    #[test]
    fn turn_complete_flushes_partial_buffer() {
        for count in [1u8, 2] {
            let mut processor = InboundProcessor::new();
            let mut messages: Vec<_> = (0..count).map(fragment).collect();
            messages.push(InboundMessage::TurnComplete);
            let batches = feed(&mut processor, messages);
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), usize::from(count));
            assert_eq!(processor.buffered(), 0);
        }
    }

    #[test]
    fn turn_complete_with_empty_buffer_is_quiet() {
        let mut processor = InboundProcessor::new();
        assert!(processor.process(InboundMessage::TurnComplete).is_empty());
    }

    #[test]
    fn interrupt_discards_buffer() {
        let mut processor = InboundProcessor::new();
        processor.process(fragment(1));
        processor.process(fragment(2));

        let effects = processor.process(InboundMessage::Interrupted);
        assert_eq!(effects, vec![Effect::Interrupt]);

        let batches = feed(
            &mut processor,
            vec![fragment(3), InboundMessage::TurnComplete],
        );
        assert_eq!(batches, vec![vec![vec![3, 3]]]);
    }

    #[test]
    fn routes_control_messages() {
        let mut processor = InboundProcessor::new();
        assert_eq!(
            processor.process(InboundMessage::ResumptionUpdate("h".into())),
            vec![Effect::StoreHandle("h".into())]
        );
        assert!(processor.process(InboundMessage::GoAway(Some("10s".into()))).is_empty());
        assert_eq!(
            processor.process(InboundMessage::ModelText("hello".into())),
            vec![Effect::Transcript("hello".into())]
        );

        let calls = vec![ToolCallRecord {
            id: "1".into(),
            name: "generate_visual_explanation".into(),
            args: serde_json::json!({"question": "why is the sky blue"}),
        }];
        assert_eq!(
            processor.process(InboundMessage::ToolCall(calls.clone())),
            vec![Effect::DispatchTools(calls)]
        );
    }
}
