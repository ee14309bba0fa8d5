//! Text helpers shared by intake, scoring and posting.
//!
//! Status text arrives with HTML entities, line breaks, mentions, retweet
//! markers and links. Everything downstream works on the cleaned form.

use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;

/// Maximum length of a plain status.
pub const MAX_STATUS_LENGTH: usize = 140;
/// Maximum length of a status that carries media.
pub const MAX_STATUS_WITH_MEDIA_LENGTH: usize = 116;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));
static RETWEET_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^RT @[a-zA-Z0-9_]+:\s").expect("static regex"));
static MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@[a-zA-Z0-9_]+\s?").expect("static regex"));
static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#[a-zA-Z0-9_]+\s?").expect("static regex"));
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S*\s?").expect("static regex"));

/// Which decorations `clean` strips besides whitespace normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanOptions {
    pub replies: bool,
    pub hashtags: bool,
    pub rts: bool,
    pub urls: bool,
}

impl CleanOptions {
    /// Whitespace and entities only.
    pub fn plain() -> Self {
        Self::default()
    }

    /// Options used for candidate text: mentions, retweet markers and links removed.
    pub fn candidate() -> Self {
        Self {
            replies: true,
            hashtags: false,
            rts: true,
            urls: true,
        }
    }
}

/// Normalize status text.
pub fn clean(text: &str, options: CleanOptions) -> String {
    let text = text.replace(['\n', '\r'], " ");
    let text = WHITESPACE.replace_all(&text, " ");
    let mut text = unescape_html(&text).trim().to_string();

    if options.rts {
        text = RETWEET_MARKER.replace(&text, "").into_owned();
    }
    if options.replies {
        text = MENTION.replace_all(&text, "").into_owned();
    }
    if options.hashtags {
        text = HASHTAG.replace_all(&text, "").into_owned();
    }
    if options.urls {
        text = URL.replace_all(&text, "").into_owned();
    }

    text.trim().to_string()
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// Truncate to `max_chars` characters, marking the cut with an ellipsis.
pub fn ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Share of non-whitespace characters that are ASCII letters.
///
/// Empty (or all-whitespace) text has a ratio of 0.
pub fn latin_ratio(text: &str) -> f64 {
    let (letters, total) = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .fold((0usize, 0usize), |(letters, total), c| {
            (letters + usize::from(c.is_ascii_alphabetic()), total + 1)
        });

    if total == 0 {
        return 0.0;
    }
    letters as f64 / total as f64
}

/// Render a wait in seconds the way a throttled user reads it.
pub fn humanize(seconds: u64) -> String {
    fn unit(n: u64, name: &str) -> String {
        if n == 1 { format!("1 {}", name) } else { format!("{} {}s", n, name) }
    }

    match seconds {
        0..60 => unit(seconds, "second"),
        60..3600 => unit(seconds.div_ceil(60), "minute"),
        _ => unit(seconds.div_ceil(3600), "hour"),
    }
}

/// Picks a short run of words from a longer text to use as a caption.
#[derive(Debug, Clone)]
pub struct PhrasePicker {
    pub min_words: usize,
    pub max_words: usize,
    pub min_len: usize,
    pub tries: usize,
}

impl Default for PhrasePicker {
    fn default() -> Self {
        Self {
            min_words: 1,
            max_words: 4,
            min_len: 4,
            tries: 10,
        }
    }
}

impl PhrasePicker {
    /// Pick a phrase using the thread-local RNG.
    pub fn pick(&self, text: &str) -> String {
        self.pick_with(text, &mut rand::thread_rng())
    }

    /// Pick a contiguous run of words at least `min_len` characters long.
    ///
    /// Falls back to the whole text when no try produces a long enough run.
    pub fn pick_with<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> String {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return String::new();
        }

        let min_words = self.min_words.max(1);
        let max_words = self.max_words.max(min_words);

        for _ in 0..self.tries {
            let start = rng.gen_range(0..words.len());
            let length = rng.gen_range(min_words..=max_words);
            let end = (start + length).min(words.len());
            let phrase = words[start..end].join(" ");
            if phrase.chars().count() >= self.min_len {
                return phrase;
            }
        }

        words.join(" ")
    }
}
