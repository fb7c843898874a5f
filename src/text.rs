//! Outbound text conditioning.
//!
//! The engine reads a legacy single-byte code page and silently misbehaves on
//! control characters, so everything is normalized before it crosses the FFI
//! boundary: controls become spaces, whitespace collapses, and characters the
//! code page cannot express become spaces rather than placeholder glyphs.
//! Long inputs are split on word boundaries because the engine has an
//! internal text-length limit, and chunk edges double as cancellation points.

use encoding_rs::{EncoderResult, WINDOWS_1252};

/// Engine-side text limit per synthesis call.
pub(crate) const MAX_CHUNK_BYTES: usize = 350;

/// Normalize and transliterate one utterance for the engine.
pub(crate) fn prepare(text: &str) -> Vec<u8> {
    let mut cleaned = String::with_capacity(text.len());
    let mut prev_space = true;
    for mut ch in text.chars() {
        if ch == '\u{00A0}' {
            ch = ' ';
        }
        let code = ch as u32;
        if (code < 0x20 && ch != '\r' && ch != '\n' && ch != '\t')
            || (0x7F..=0x9F).contains(&code)
        {
            ch = ' ';
        }

        let is_space = matches!(ch, ' ' | '\t' | '\r' | '\n');
        if is_space {
            if !prev_space {
                cleaned.push(' ');
            }
            prev_space = true;
        } else {
            cleaned.push(ch);
            prev_space = false;
        }
    }
    while cleaned.ends_with(' ') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        return Vec::new();
    }

    // Transliterate; anything outside the code page becomes a space.
    let mut encoder = WINDOWS_1252.new_encoder();
    let mut out = Vec::with_capacity(cleaned.len());
    let mut src = cleaned.as_str();
    let mut buf = [0u8; 256];
    loop {
        let (result, read, written) =
            encoder.encode_from_utf8_without_replacement(src, &mut buf, true);
        out.extend_from_slice(&buf[..written]);
        src = &src[read..];
        match result {
            EncoderResult::InputEmpty => break,
            EncoderResult::OutputFull => {}
            EncoderResult::Unmappable(_) => out.push(b' '),
        }
    }

    // Replacement may have produced runs of spaces; collapse once more.
    let mut collapsed = Vec::with_capacity(out.len());
    let mut prev_space = true;
    for b in out {
        if b == b' ' {
            if !prev_space {
                collapsed.push(b' ');
            }
            prev_space = true;
        } else {
            collapsed.push(b);
            prev_space = false;
        }
    }
    while collapsed.last() == Some(&b' ') {
        collapsed.pop();
    }
    collapsed
}

/// Split prepared text into engine-sized chunks, preferring the first space
/// at or past the limit so words stay whole. Hard-splits only when a chunk
/// has no space at all.
pub(crate) fn split_chunks(text: &[u8], limit: usize) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    if text.is_empty() || limit == 0 {
        return chunks;
    }

    let mut start = 0;
    while start < text.len() {
        let remaining = text.len() - start;
        if remaining <= limit {
            chunks.push(text[start..].to_vec());
            break;
        }

        let split = match text[start + limit..].iter().position(|&b| b == b' ') {
            Some(pos) => start + limit + pos,
            None => start + limit,
        };

        if split > start {
            chunks.push(text[start..split].to_vec());
        }

        start = split;
        while start < text.len() && text[start] == b' ' {
            start += 1;
        }
    }
    chunks
}
