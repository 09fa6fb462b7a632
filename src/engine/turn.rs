//! Streaming turn processor: transcribe, generate, synthesize.
//!
//! One [`TurnRunner`] task runs per captured utterance (or per AI
//! greeting). It reads an immutable snapshot of the mounted profile at
//! dispatch time and communicates back exclusively through events, so all
//! state changes still flow through the reducer in queue order.
//! Cancellation is cooperative: the shared interrupt flag and the turn's
//! cancellation token are both checked every loop iteration.

use crate::audio::playback::SentenceJob;
use crate::config::RetryConfig;
use crate::engine::events::Event;
use crate::engine::prompt;
use crate::memory::{ChatMessage, ConversationMemory, Role};
use crate::profile::{PhaseProfile, Profile};
use crate::providers::{
    FailureKind, GenerationRequest, LanguageModel, SpeechToText, TokenStream, Transcript,
};
use crate::signals::parse::{SignalTagScanner, spoken_text};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-turn worker context, snapshotted at dispatch time.
pub(crate) struct TurnRunner {
    pub profile: Arc<Profile>,
    pub plan: Option<(Arc<PhaseProfile>, String)>,
    pub memory: Arc<Mutex<ConversationMemory>>,
    pub asr: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub events: mpsc::UnboundedSender<Event>,
    pub sentences: mpsc::Sender<SentenceJob>,
    pub interrupt: Arc<AtomicBool>,
    pub assistant_speaking: Arc<AtomicBool>,
    pub cancel: CancellationToken,
    pub retry: RetryConfig,
    pub sample_rate: u32,
}

impl TurnRunner {
    /// Process one captured human utterance end to end.
    pub async fn process_turn(self, audio: Arc<Vec<f32>>, ack_prefix: Option<String>) {
        // Another reply began between dispatch and execution; an empty
        // final transcript records the turn as skipped.
        if self.assistant_speaking.load(Ordering::Relaxed) {
            debug!("assistant already speaking, skipping captured turn");
            let _ = self.events.send(Event::AsrFinal {
                text: String::new(),
                latency_ms: 0,
            });
            return;
        }

        let transcript = match self.transcribe_with_retry(&audio).await {
            Ok(t) => t,
            Err(kind) => {
                let _ = self.events.send(Event::LlmError { kind });
                return;
            }
        };

        let trimmed = transcript.text.trim();
        if trimmed.is_empty() {
            // The acknowledgment prefix is discarded along with the turn:
            // a generation over nothing but our own interjection would
            // produce a reply to silence.
            let _ = self.events.send(Event::AsrFinal {
                text: String::new(),
                latency_ms: transcript.latency_ms,
            });
            return;
        }

        let user_text = match &ack_prefix {
            Some(ack) => format!("{ack} {trimmed}"),
            None => trimmed.to_owned(),
        };
        info!("user said: \"{user_text}\"");
        let _ = self.events.send(Event::AsrFinal {
            text: user_text.clone(),
            latency_ms: transcript.latency_ms,
        });

        self.run_generation(Some(user_text)).await;
    }

    /// Generate and speak an opening line with no user utterance.
    pub async fn greeting(self) {
        self.run_generation(None).await;
    }

    /// Stream one generation. The turn's messages land in memory only
    /// after the generation has produced something. A turn abandoned on
    /// a collaborator failure leaves no trace in the transcript, and the
    /// user/assistant pair is written under one lock.
    async fn run_generation(&self, user_text: Option<String>) {
        let system_prompt = prompt::compose_system_prompt(
            &self.profile,
            self.plan
                .as_ref()
                .map(|(plan, phase_id)| (plan.as_ref(), phase_id.as_str())),
        );
        let mut messages = self
            .memory
            .lock()
            .map(|m| m.messages())
            .unwrap_or_default();
        if let Some(user) = &user_text {
            messages.push(ChatMessage {
                role: Role::User,
                content: user.clone(),
            });
        }
        let request = GenerationRequest {
            system_prompt,
            messages,
            max_tokens: self.profile.max_tokens,
            temperature: self.profile.temperature,
        };

        let started = Instant::now();
        let mut stream = match self.open_stream_with_retry(request).await {
            Ok(stream) => stream,
            Err(kind) => {
                let _ = self.events.send(Event::LlmError { kind });
                return;
            }
        };

        let mut full = String::new();
        let mut scanner = SignalTagScanner::default();
        let mut splitter = SentenceSplitter::default();
        let mut interrupted = false;

        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                item = stream.next() => item,
            };
            if self.interrupt.load(Ordering::Relaxed) {
                interrupted = true;
                break;
            }
            let Some(item) = item else {
                break;
            };
            match item {
                Ok(token) => {
                    full.push_str(&token);
                    let _ = self.events.send(Event::LlmToken { token: token.clone() });

                    let visible = scanner.push(&token);
                    for sentence in splitter.push(&visible) {
                        if !self.send_sentence(sentence).await {
                            interrupted = true;
                            break;
                        }
                    }
                    if scanner.tag_seen() {
                        // Anything unfinished at the tag boundary is not
                        // spoken.
                        splitter.discard();
                    }
                    if interrupted {
                        break;
                    }
                }
                Err(e) => {
                    warn!("token stream failed mid-response: {e}");
                    let _ = self.events.send(Event::LlmError { kind: e.kind });
                    return;
                }
            }
        }
        // Dropping the stream propagates cancellation to the provider.
        drop(stream);

        if interrupted {
            debug!("generation cancelled mid-stream");
            // The words already spoken are part of the conversation.
            self.record_turn(user_text.as_deref(), &spoken_text(&full));
            return;
        }

        if !scanner.tag_seen() {
            let tail = scanner.finish();
            for sentence in splitter.push(&tail) {
                let _ = self.send_sentence(sentence).await;
            }
            if let Some(rest) = splitter.flush() {
                let _ = self.send_sentence(rest).await;
            }
        }

        // Record before announcing completion: a phase transition fired
        // by this reply clears memory, and that clear must land after
        // this turn's entries.
        self.record_turn(user_text.as_deref(), &spoken_text(&full));

        let latency_ms = started.elapsed().as_millis() as u64;
        let _ = self.events.send(Event::LlmDone {
            full_text: full.clone(),
            latency_ms,
        });

        // Ask the synthesizer to report once the queue drains; a reply
        // with no speakable sentences still closes the turn this way.
        let _ = self.sentences.send(SentenceJob::EndOfUtterance).await;
    }

    /// Commit the turn's transcript entries in one lock scope.
    fn record_turn(&self, user_text: Option<&str>, assistant_text: &str) {
        if let Ok(mut memory) = self.memory.lock() {
            if let Some(user) = user_text {
                memory.push_user(user);
            }
            memory.push_assistant(assistant_text);
        }
    }

    async fn send_sentence(&self, sentence: String) -> bool {
        if self.interrupt.load(Ordering::Relaxed) || self.cancel.is_cancelled() {
            return false;
        }
        let _ = self.events.send(Event::TtsStarted {
            sentence: sentence.clone(),
        });
        self.sentences
            .send(SentenceJob::Speak {
                text: sentence,
                voice: self.profile.voice.clone(),
                interjection: false,
            })
            .await
            .is_ok()
    }

    async fn transcribe_with_retry(
        &self,
        audio: &[f32],
    ) -> std::result::Result<Transcript, FailureKind> {
        let mut attempt = 1;
        loop {
            match self.asr.transcribe(audio, self.sample_rate).await {
                Ok(transcript) => return Ok(transcript),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(attempt, "transcription failed, retrying: {e}");
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.kind),
            }
        }
    }

    async fn open_stream_with_retry(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<TokenStream, FailureKind> {
        let mut attempt = 1;
        loop {
            match self.llm.stream(request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(attempt, "generation request failed, retrying: {e}");
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.kind),
            }
        }
    }
}

/// Find the byte index of a sentence terminator (`.`, `!`, `?`) followed
/// by whitespace. A terminator at the very end of the buffer is left for
/// [`SentenceSplitter::flush`], since more of the token stream may still
/// arrive.
pub(crate) fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let rest = &text[i + c.len_utf8()..];
            if rest.starts_with(char::is_whitespace) {
                return Some(i);
            }
        }
    }
    None
}

/// Accumulates streamed text and yields complete sentences.
#[derive(Debug, Default)]
pub(crate) struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    /// Feed a fragment; returns every sentence completed by it.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        if fragment.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(fragment);
        let mut sentences = Vec::new();
        while let Some(pos) = find_sentence_boundary(&self.buffer) {
            let sentence = self.buffer[..=pos].trim().to_owned();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            self.buffer = self.buffer[pos + 1..].to_owned();
        }
        sentences
    }

    /// End-of-stream: return the trailing fragment, terminator or not.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_owned())
        }
    }

    /// Drop whatever is buffered (tag boundary).
    pub fn discard(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    // ── sentence splitting ───────────────────────────────────────────

    #[test]
    fn splits_on_terminator_followed_by_space() {
        let mut splitter = SentenceSplitter::default();
        let out = splitter.push("First one. Second");
        assert_eq!(out, vec!["First one.".to_owned()]);
        assert_eq!(splitter.flush(), Some("Second".to_owned()));
    }

    #[test]
    fn trailing_terminator_waits_for_flush() {
        let mut splitter = SentenceSplitter::default();
        assert!(splitter.push("Is that so?").is_empty());
        assert_eq!(splitter.flush(), Some("Is that so?".to_owned()));
    }

    #[test]
    fn decimal_points_do_not_split() {
        let mut splitter = SentenceSplitter::default();
        let out = splitter.push("Pi is 3.14 roughly! Yes");
        assert_eq!(out, vec!["Pi is 3.14 roughly!".to_owned()]);
    }

    #[test]
    fn fragments_reassemble_across_pushes() {
        let mut splitter = SentenceSplitter::default();
        assert!(splitter.push("Hel").is_empty());
        assert!(splitter.push("lo there").is_empty());
        let out = splitter.push(". Next");
        assert_eq!(out, vec!["Hello there.".to_owned()]);
    }

    // ── suppression composed with splitting ──────────────────────────

    #[test]
    fn no_sentence_after_tag_reaches_output() {
        use crate::signals::parse::SignalTagScanner;

        let tokens = [
            "Sure",
            ". I can help",
            ". <sig",
            "nals>{\"a\": 1}</signals>",
            " ignored trailer.",
        ];
        let mut scanner = SignalTagScanner::default();
        let mut splitter = SentenceSplitter::default();
        let mut spoken = Vec::new();

        for token in tokens {
            let visible = scanner.push(token);
            spoken.extend(splitter.push(&visible));
            if scanner.tag_seen() {
                splitter.discard();
            }
        }
        if !scanner.tag_seen() {
            if let Some(rest) = splitter.flush() {
                spoken.push(rest);
            }
        }

        assert_eq!(
            spoken,
            vec!["Sure.".to_owned(), "I can help.".to_owned()]
        );
    }

    #[test]
    fn incomplete_sentence_before_tag_is_dropped() {
        use crate::signals::parse::SignalTagScanner;

        let mut scanner = SignalTagScanner::default();
        let mut splitter = SentenceSplitter::default();
        let mut spoken = Vec::new();

        let visible = scanner.push("Done. And one more thing <signals>{\"x\":1}</signals>");
        spoken.extend(splitter.push(&visible));
        if scanner.tag_seen() {
            splitter.discard();
        }

        assert_eq!(spoken, vec!["Done.".to_owned()]);
    }
}
