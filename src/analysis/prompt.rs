//! Prompt text for repetition detection.

const OUTPUT_FORMAT: &str = r#"OUTPUT FORMAT:
Return a JSON object with a single key "data" containing an array of objects with these keys:
- "startTime": timestamp in seconds, exactly as given in the input
- "endTime": timestamp in seconds, exactly as given in the input
- "type": "repetition"
- "isEntire": true or false

Only include segments that are repetitions. Return only the JSON, without commentary."#;

pub fn sentence_prompt(transcript: &str) -> String {
    format!(
        r#"You process speech transcripts of recorded videos. Speakers often repeat parts of their script; identify every repeated segment and mark it as "repetition", except the very last occurrence.

RULES:
1. Process the transcript in chronological order.
2. When a sentence, or a sentence with essentially the same meaning, appears more than once, only the last occurrence is valid.
3. Mark every earlier occurrence as a repetition.
4. If a whole sentence is repeated later, set "isEntire": true. If only part of the sentence is repeated before it is completed, set "isEntire": false.
5. Do not alter timestamps.

INPUT FORMAT:
Each line is: start_time end_time text
{transcript}

{OUTPUT_FORMAT}

EXAMPLE:
Transcript:
0.32 2.26 hi everyone
3.40 4.89 hello everyone! Happy to see you all.
Output:
{{"data": [{{"startTime": "0.32", "endTime": "2.26", "type": "repetition", "isEntire": true}}]}}
"#
    )
}

pub fn word_prompt(transcript: &str) -> String {
    format!(
        r#"You process word-level timestamps from sentences where the speaker restarted part of the sentence. Each block below, separated by a blank line, is one sentence. Within each block, find the words that were spoken and then repeated or abandoned, and mark them as "repetition", keeping the last, complete version.

RULES:
1. Work one block at a time; never combine words from different blocks.
2. Use the start time of the first repeated word and the end time of the last repeated word.
3. Do not alter timestamps.

INPUT FORMAT:
Each line is: start_time end_time word
{transcript}

{OUTPUT_FORMAT}

EXAMPLE:
Transcript:
12.32 12.50 you
12.50 12.80 can
13.00 13.20 you
13.20 13.50 can
13.60 13.80 do
13.80 14.10 it.
Output:
{{"data": [{{"startTime": "12.32", "endTime": "12.80", "type": "repetition", "isEntire": false}}]}}
"#
    )
}
