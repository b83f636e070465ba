use crate::types::{RenderedBlock, Update};
use tracing::warn;

/// Maximum body length of one rendered block.
pub const BLOCK_BODY_LIMIT: usize = 4_096;
/// Overall cap on an update's renderable text (five full blocks).
pub const BODY_CAP: usize = BLOCK_BODY_LIMIT * 5;
/// Maximum block title length.
pub const TITLE_LIMIT: usize = 256;

const CONTINUATION: &str = "...";
const CONTINUED_PREFIX: &str = "(Cont.) ";

/// Palette of author colors; one is picked deterministically per author.
pub const USER_COLORS: [u32; 10] = [
    0xb366ff, 0xff6666, 0x66b3ff, 0xffcc66, 0x66ffb3, 0xff66b3, 0xb3ff66, 0x66ffcc, 0xcc66ff,
    0x66b3cc,
];

/// Legacy author hash, kept bit-for-bit: over the UTF-16 units of the
/// input, `d = (unit * (p *= 2) + d) mod 13` with `d` seeded at 7. The
/// multiplier is reduced mod 13 each step, which keeps the recurrence
/// exact for inputs of any length.
pub fn author_hash(input: &str) -> u32 {
    let mut d: u64 = 7;
    let mut p: u64 = 1;
    for unit in input.encode_utf16() {
        p = (p * 2) % 13;
        d = (u64::from(unit) * p + d) % 13;
    }
    d as u32
}

/// Deterministic palette entry for an author, keyed by profile URL.
pub fn author_color(author_url: &str) -> u32 {
    USER_COLORS[author_hash(author_url) as usize % USER_COLORS.len()]
}

/// Truncate to `max` characters, replacing the tail with an ellipsis when
/// anything was cut.
fn abbreviate(text: &str, max: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max {
        return text.to_string();
    }
    let mut out: String = chars[..max - CONTINUATION.len()].iter().collect();
    out.push_str(CONTINUATION);
    out
}

/// Render one update into its sequence of size-bounded blocks.
///
/// The body comes from the HTML field converted to markdown when present
/// (falling back to the plain-text field on conversion failure), prefixed
/// with a source attribution line, capped at [`BODY_CAP`], then split into
/// [`BLOCK_BODY_LIMIT`]-sized chunks with three characters of every
/// non-final chunk reserved for a continuation ellipsis.
pub fn render_update(update: &Update) -> Vec<RenderedBlock> {
    let mut body = update.text.clone().unwrap_or_default();
    if let Some(html) = &update.html {
        match std::panic::catch_unwind(|| html2md::parse_html(html)) {
            Ok(markdown) => body = markdown,
            Err(_) => {
                warn!(url = %update.url, "failed to convert HTML to markdown, using plain text");
            }
        }
    }

    let full = format!(
        "**(from [{}]({}))**\n\n{}",
        update.kind.label(),
        update.url,
        body
    );
    let capped = abbreviate(full.trim(), BODY_CAP);
    let chars: Vec<char> = capped.chars().collect();
    let step = BLOCK_BODY_LIMIT - CONTINUATION.len();

    let color = author_color(&update.author_url);
    let mut blocks = Vec::new();
    let mut start = 0;
    loop {
        let is_final = start + BLOCK_BODY_LIMIT >= chars.len();
        let body = if is_final {
            chars[start..].iter().collect()
        } else {
            let mut chunk: String = chars[start..start + step].iter().collect();
            chunk.push_str(CONTINUATION);
            chunk
        };

        let title = if start > 0 {
            abbreviate(&format!("{CONTINUED_PREFIX}{}", update.topic_title), TITLE_LIMIT)
        } else {
            abbreviate(&update.topic_title, TITLE_LIMIT)
        };

        blocks.push(RenderedBlock {
            title,
            color,
            author: update.author.clone(),
            author_url: update.author_url.clone(),
            author_image: update.author_image.clone(),
            timestamp: update.time,
            image: update.image.clone(),
            link: update.link.clone(),
            body,
        });

        if is_final {
            break;
        }
        start += step;
    }
    blocks
}
