//! Recognition turn state shared by both speech backends.

/// Observable state of the current recognition turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognitionSnapshot {
    pub interim_text: String,
    pub finalized_segments: Vec<String>,
    /// Capturing from the microphone.
    pub is_recognizing: bool,
    /// Capture stopped and the utterance is complete.
    pub is_stopping: bool,
}

impl RecognitionSnapshot {
    /// The finalized segments joined into one utterance.
    #[must_use]
    pub fn utterance(&self) -> String {
        self.finalized_segments.concat()
    }
}

/// Accumulates one capture turn.
///
/// Every [`begin`](Self::begin) starts a new epoch. Work scheduled for an
/// older epoch (a settle timer, a late transcript) must present its epoch
/// to [`finish`](Self::finish) and is ignored once a newer turn started.
#[derive(Debug, Default)]
pub struct RecognitionSession {
    interim: String,
    segments: Vec<String>,
    recognizing: bool,
    stopping: bool,
    epoch: u64,
}

impl RecognitionSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh turn and return its epoch.
    pub fn begin(&mut self) -> u64 {
        self.interim.clear();
        self.segments.clear();
        self.recognizing = true;
        self.stopping = false;
        self.epoch += 1;
        self.epoch
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn is_recognizing(&self) -> bool {
        self.recognizing
    }

    /// Capture stopped; results may still arrive until the turn finishes.
    pub fn end_capture(&mut self) {
        self.recognizing = false;
    }

    /// Replace the interim hypothesis.
    pub fn set_interim(&mut self, text: String) {
        self.interim = text;
    }

    /// Replace the interim hypothesis only if `text` is longer.
    ///
    /// Streaming recognizers repeat partial hypotheses at word level; a
    /// shorter one is taken to be a repeat. A genuine correction that
    /// shortens the text is lost until the segment finalizes.
    pub fn offer_interim(&mut self, text: String) -> bool {
        if text.chars().count() > self.interim.chars().count() {
            self.interim = text;
            true
        } else {
            false
        }
    }

    /// Append a finalized segment and clear the interim hypothesis.
    pub fn push_final(&mut self, text: String) {
        self.interim.clear();
        if !text.is_empty() {
            self.segments.push(text);
        }
    }

    /// Complete the turn started at `epoch` and return the utterance.
    ///
    /// With `fold_interim` a pending interim hypothesis becomes the last
    /// segment; otherwise it is discarded. Returns `None` if a newer turn
    /// has begun since.
    pub fn finish(&mut self, epoch: u64, fold_interim: bool) -> Option<String> {
        if epoch != self.epoch {
            return None;
        }
        let interim = std::mem::take(&mut self.interim);
        if fold_interim && !interim.is_empty() {
            self.segments.push(interim);
        }
        self.recognizing = false;
        self.stopping = true;
        Some(self.segments.concat())
    }

    /// Forget the consumed turn before the next one.
    pub fn clear(&mut self) {
        self.interim.clear();
        self.segments.clear();
        self.stopping = false;
    }

    #[must_use]
    pub fn snapshot(&self) -> RecognitionSnapshot {
        RecognitionSnapshot {
            interim_text: self.interim.clone(),
            finalized_segments: self.segments.clone(),
            is_recognizing: self.recognizing,
            is_stopping: self.stopping,
        }
    }
}
