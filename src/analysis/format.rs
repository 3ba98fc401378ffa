use crate::interval::RemovalInterval;
use crate::transcription::Transcript;

/// One `start end text` line per sentence, times to two decimals.
pub fn format_sentences(transcript: &Transcript) -> String {
    transcript
        .sentences
        .iter()
        .map(|s| format!("{:.2} {:.2} {}\n", s.start, s.end, s.text))
        .collect()
}

/// Word lines for every partially repeated sentence, one block per interval,
/// blocks separated by a blank line. Empty when there is nothing to refine.
pub fn format_words(transcript: &Transcript, sentence_removals: &[RemovalInterval]) -> String {
    sentence_removals
        .iter()
        .filter(|r| !r.is_entire_segment)
        .map(|r| {
            transcript
                .words_between(r.start_time, r.end_time)
                .map(|w| format!("{:.2} {:.2} {}\n", w.start, w.end, w.word))
                .collect::<String>()
        })
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
