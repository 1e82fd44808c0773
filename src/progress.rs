//! Progress bars sharing the terminal with log output.
//!
//! Every bar is registered on one [`MultiProgress`]; the logger installed with
//! `wrap` prints through it so log lines do not tear the bars.

use console::Term;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::info;
use std::sync::OnceLock;

use crate::error::Result;

const TEXT_RATIO: usize = 4;
const FALLBACK_TERM_WIDTH: usize = 80;
const TEMPLATE: &str = "{msg} {elapsed_precise} [{wide_bar}] ETA {eta_precise}";

static MULTI_PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

pub fn multi_progress() -> &'static MultiProgress {
    MULTI_PROGRESS.get_or_init(MultiProgress::new)
}

/// Default visible progress bar: descriptive text, timer, bar and ETA.
///
/// The text takes a quarter of the terminal width.
pub fn progress_bar(len: u64, text: Option<&str>) -> Result<ProgressBar> {
    let style = ProgressStyle::with_template(TEMPLATE)?.progress_chars("=> ");
    let bar = multi_progress().add(ProgressBar::new(len).with_style(style));

    if let Some(text) = text {
        bar.set_message(shrink_text(text, term_width() / TEXT_RATIO));
    }
    Ok(bar)
}

/// Muted progress bar: the text is logged once and nothing is drawn.
pub fn null_bar(len: u64, text: Option<&str>) -> ProgressBar {
    if let Some(text) = text {
        info!("{}", text);
    }
    let bar = ProgressBar::hidden();
    bar.set_length(len);
    bar
}

/// Fits `text` in exactly `width` characters, cutting the middle with `...`.
pub fn shrink_text(text: &str, width: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= width {
        return format!("{:<width$}", text, width = width);
    }

    let half = width / 2;
    let head: String = chars[..half.saturating_sub(2)].iter().collect();
    let tail: String = chars[chars.len() - half.saturating_sub(1)..].iter().collect();
    let shrunk = format!("{}...{}", head.trim(), tail.trim());
    format!("{:<width$}", shrunk, width = width)
}

fn term_width() -> usize {
    match Term::stderr().size_checked() {
        Some((_, columns)) => columns as usize,
        None => FALLBACK_TERM_WIDTH,
    }
}
