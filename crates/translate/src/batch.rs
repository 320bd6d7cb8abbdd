//! Marker protocol for batched translation requests, plus the pure output
//! heuristics applied to every translator response.
//!
//! A batch packs several items into one request. Marker lines delimit items;
//! the backend is instructed to reproduce them verbatim and translate only
//! the text between them. Unpacking tolerates partial responses: an item
//! whose marker is missing is simply absent from the result map.

use std::collections::HashMap;

/// Literal marker opening an item: `<<<ITEM:id>>>`.
pub const ITEM_MARKER_PREFIX: &str = "<<<ITEM:";
pub const ITEM_MARKER_SUFFIX: &str = ">>>";
/// Literal marker terminating the batch body.
pub const END_MARKER: &str = "<<<END>>>";

const BATCH_PREAMBLE: &str = "Translate every segment below. Lines of the form <<<ITEM:id>>> and the final <<<END>>> are markers: reproduce them verbatim, translate only the text between them, and keep Markdown formatting intact.";

/// Marker line for one item id.
pub fn item_marker(id: &str) -> String {
    format!("{ITEM_MARKER_PREFIX}{id}{ITEM_MARKER_SUFFIX}")
}

/// Pack `(id, text)` pairs into a single batched request body.
pub fn pack_batch(items: &[(String, String)]) -> String {
    let mut out = String::with_capacity(
        BATCH_PREAMBLE.len() + items.iter().map(|(i, t)| i.len() + t.len() + 16).sum::<usize>(),
    );
    out.push_str(BATCH_PREAMBLE);
    out.push('\n');
    for (id, text) in items {
        out.push('\n');
        out.push_str(&item_marker(id));
        out.push('\n');
        out.push_str(text);
        out.push('\n');
    }
    out.push_str(END_MARKER);
    out.push('\n');
    out
}

/// Unpack a batched response by scanning for marker lines.
///
/// Only ids listed in `ids` are recognized; anything between a known marker
/// and the next marker (or `<<<END>>>`, or EOF) becomes that id's output.
/// Items whose marker never appears are absent from the map.
pub fn unpack_batch(response: &str, ids: &[String]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut current: Option<(&String, Vec<&str>)> = None;

    for line in response.lines() {
        let trimmed = line.trim();
        let is_end = trimmed == END_MARKER;
        let marker_id = trimmed
            .strip_prefix(ITEM_MARKER_PREFIX)
            .and_then(|rest| rest.strip_suffix(ITEM_MARKER_SUFFIX))
            .and_then(|id| ids.iter().find(|known| known.as_str() == id));

        if is_end || marker_id.is_some() {
            if let Some((id, lines)) = current.take() {
                out.insert(id.clone(), lines.join("\n").trim().to_string());
            }
            current = marker_id.map(|id| (id, Vec::new()));
            if is_end {
                break;
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some((id, lines)) = current.take() {
        out.insert(id.clone(), lines.join("\n").trim().to_string());
    }

    out.retain(|_, text| !text.is_empty());
    out
}

/// Whether the translated output preserves the source's Markdown structure.
///
/// Checks the structural contract only: fenced-code-block count and literal
/// marker lines must survive. Translation quality is out of scope.
pub fn preserves_markdown(source: &str, output: &str) -> bool {
    if fence_count(source) != fence_count(output) {
        return false;
    }
    source
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with(ITEM_MARKER_PREFIX) || *l == END_MARKER)
        .all(|marker| output.lines().any(|l| l.trim() == marker))
}

fn fence_count(text: &str) -> usize {
    text.lines().filter(|l| l.trim_start().starts_with("```")).count()
}

/// Minimum source length before identical output counts as "untranslated".
/// Short strings (identifiers, numbers, one-word answers) legitimately
/// survive translation unchanged.
const UNTRANSLATED_MIN_LEN: usize = 32;

/// Heuristic: the backend echoed the input back instead of translating.
pub fn looks_untranslated(source: &str, output: &str) -> bool {
    let src = source.trim();
    src.len() >= UNTRANSLATED_MIN_LEN && src == output.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pack_then_unpack_round_trips() {
        let items = vec![
            ("id1".to_string(), "a".to_string()),
            ("id2".to_string(), "b".to_string()),
        ];
        let packed = pack_batch(&items);
        assert!(packed.contains("<<<ITEM:id1>>>"));
        assert!(packed.contains("<<<ITEM:id2>>>"));
        assert!(packed.ends_with("<<<END>>>\n"));

        // A well-formed response: markers verbatim, payloads translated.
        let response = "<<<ITEM:id1>>>\na_out\n<<<ITEM:id2>>>\nb_out\n<<<END>>>";
        let unpacked = unpack_batch(response, &ids(&["id1", "id2"]));
        assert_eq!(unpacked.len(), 2);
        assert_eq!(unpacked["id1"], "a_out");
        assert_eq!(unpacked["id2"], "b_out");
    }

    #[test]
    fn unpack_with_missing_marker_yields_partial_map() {
        let response = "<<<ITEM:id1>>>\na_out\n<<<END>>>";
        let unpacked = unpack_batch(response, &ids(&["id1", "id2"]));
        assert_eq!(unpacked.len(), 1);
        assert_eq!(unpacked["id1"], "a_out");
        assert!(!unpacked.contains_key("id2"));
    }

    #[test]
    fn unpack_ignores_unknown_markers_and_preamble_noise() {
        let response =
            "Sure, here you go:\n<<<ITEM:bogus>>>\nx\n<<<ITEM:id1>>>\nout\nmore out\n<<<END>>>\ntrailing chatter";
        let unpacked = unpack_batch(response, &ids(&["id1"]));
        assert_eq!(unpacked.len(), 1);
        assert_eq!(unpacked["id1"], "out\nmore out");
    }

    #[test]
    fn unpack_without_end_marker_still_closes_last_item() {
        let response = "<<<ITEM:id1>>>\nout";
        let unpacked = unpack_batch(response, &ids(&["id1"]));
        assert_eq!(unpacked["id1"], "out");
    }

    #[test]
    fn unpack_drops_empty_items() {
        let response = "<<<ITEM:id1>>>\n<<<ITEM:id2>>>\nb\n<<<END>>>";
        let unpacked = unpack_batch(response, &ids(&["id1", "id2"]));
        assert!(!unpacked.contains_key("id1"));
        assert_eq!(unpacked["id2"], "b");
    }

    #[test]
    fn markdown_fence_mismatch_is_rejected() {
        let src = "Intro\n```rust\nlet x = 1;\n```\nOutro";
        let good = "介绍\n```rust\nlet x = 1;\n```\n结尾";
        let bad = "介绍\nlet x = 1;\n结尾";
        assert!(preserves_markdown(src, good));
        assert!(!preserves_markdown(src, bad));
    }

    #[test]
    fn marker_lines_must_survive() {
        let src = "<<<ITEM:id1>>>\nhello world\n<<<END>>>";
        let good = "<<<ITEM:id1>>>\n你好世界\n<<<END>>>";
        let bad = "你好世界";
        assert!(preserves_markdown(src, good));
        assert!(!preserves_markdown(src, bad));
    }

    #[test]
    fn untranslated_detection_respects_min_length() {
        let long = "This is a reasonably long sentence that should change.";
        assert!(looks_untranslated(long, long));
        assert!(!looks_untranslated(long, "这句话确实被翻译了。"));
        // Short echoes are fine.
        assert!(!looks_untranslated("ok", "ok"));
    }
}
