//! Property tests for sharding, span mapping and the grounding invariant.

use groundwork::core::sharding::{chunk_document, map_shard_span_to_document, ChunkOptions};
use groundwork::domain::{Extraction, Span, Utf16Text};
use groundwork::evidence::{assert_quote_invariant, QuoteInvariantCode};
use proptest::prelude::*;

const BMP_TEXT: &str = "[a-zA-Z0-9 .,\n\u{e9}\u{df}\u{4e2d}]{0,300}";

// Emoji and musical symbols take two code units each
const ASTRAL_TEXT: &str = "[a-z .\n\u{e9}\u{4e2d}\u{1F600}\u{1F680}\u{1D11E}]{0,200}";

fn text() -> impl Strategy<Value = String> {
    prop_oneof![BMP_TEXT, ASTRAL_TEXT]
}

fn sharding() -> impl Strategy<Value = (String, usize, usize)> {
    (text(), 1usize..64).prop_flat_map(|(text, chunk_size)| (Just(text), Just(chunk_size), 0..chunk_size))
}

fn ordered(len: usize, a: usize, b: usize) -> (usize, usize) {
    let (a, b) = (a % (len + 1), b % (len + 1));
    (a.min(b), a.max(b))
}

fn is_low_surrogate(unit: u16) -> bool {
    (0xDC00..=0xDFFF).contains(&unit)
}

/// Whether a cut at `index` leaves every surrogate pair whole
fn on_boundary(text: &Utf16Text, index: usize) -> bool {
    match text.units(index, index + 1) {
        Some(unit) => !is_low_surrogate(unit[0]),
        None => true,
    }
}

proptest! {
    #[test]
    fn shards_cover_document_without_gaps((text, chunk_size, overlap) in sharding()) {
        let options = ChunkOptions::new("doc", chunk_size, overlap);
        let shards = chunk_document(&text, "hash", &options).unwrap();
        let document = Utf16Text::new(&text);

        prop_assert_eq!(&shards, &chunk_document(&text, "hash", &options).unwrap());
        prop_assert_eq!(shards[0].start, 0);
        prop_assert_eq!(shards[shards.len() - 1].end, document.len());

        for shard in &shards {
            prop_assert!(shard.len() <= chunk_size);
            prop_assert_eq!(Utf16Text::new(&shard.text).len(), shard.len());
            if on_boundary(&document, shard.start) && on_boundary(&document, shard.end) {
                prop_assert!(document.matches(shard.start, shard.end, &shard.text));
            }
        }
        for pair in shards.windows(2) {
            prop_assert_eq!(pair[1].start, pair[0].start + chunk_size - overlap);
            prop_assert!(pair[1].start <= pair[0].end);
        }
    }

    #[test]
    fn mapped_spans_select_the_same_text(
        (text, chunk_size, overlap) in sharding(),
        pick in any::<usize>(),
        a in any::<usize>(),
        b in any::<usize>(),
    ) {
        let options = ChunkOptions::new("doc", chunk_size, overlap);
        let shards = chunk_document(&text, "hash", &options).unwrap();
        let shard = &shards[pick % shards.len()];

        let local = Utf16Text::new(&shard.text);
        let (start, end) = ordered(local.len(), a, b);
        let span = map_shard_span_to_document(shard, start as i64, end as i64).unwrap();
        prop_assert_eq!(span.char_start, shard.start + start);
        prop_assert_eq!(span.char_end - span.char_start, end - start);

        let document = Utf16Text::new(&text);
        let whole = on_boundary(&document, shard.start) && on_boundary(&document, shard.end);
        if whole && on_boundary(&document, span.char_start) && on_boundary(&document, span.char_end) {
            prop_assert_eq!(document.units(span.char_start, span.char_end), local.units(start, end));
        }
    }

    #[test]
    fn slices_satisfy_the_quote_invariant(text in text(), a in any::<usize>(), b in any::<usize>()) {
        let document = Utf16Text::new(&text);
        let (start, end) = ordered(document.len(), a, b);
        if !(on_boundary(&document, start) && on_boundary(&document, end)) {
            return Ok(());
        }
        let quote = document.slice(start, end).unwrap();

        let grounded = Extraction::new("token", quote.clone(), Span::new(start, end));
        prop_assert!(assert_quote_invariant(&document, &grounded).is_ok());

        let altered = Extraction::new("token", format!("{}#", quote), Span::new(start, end));
        let err = assert_quote_invariant(&document, &altered).unwrap_err();
        prop_assert_eq!(err.code(), QuoteInvariantCode::QuoteMismatch);
    }

    #[test]
    fn split_surrogates_never_ground(text in ASTRAL_TEXT, a in any::<usize>(), b in any::<usize>()) {
        let document = Utf16Text::new(&text);
        let (start, end) = ordered(document.len(), a, b);
        if on_boundary(&document, start) && on_boundary(&document, end) {
            return Ok(());
        }
        let quote = document.slice(start, end).unwrap();

        let lossy = Extraction::new("token", quote, Span::new(start, end));
        let err = assert_quote_invariant(&document, &lossy).unwrap_err();
        prop_assert_eq!(err.code(), QuoteInvariantCode::QuoteMismatch);
    }
}
