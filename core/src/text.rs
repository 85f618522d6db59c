//! Text gate: keyword denylist over post metadata.
//!
//! Binary and synchronous. Title, description and hashtags are joined with
//! spaces and matched against one case-insensitive, word-bounded regex that
//! is compiled once when the gate is built.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::{ModerationError, Result};

/// Built-in denylist of explicit terms.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "porn", "xxx", "sex", "hentai", "nude", "nudity", "nsfw", "cum", "blowjob", "boobs", "ass",
    "anal", "fuck", "dick", "pussy", "cock", "vagina", "breasts", "nipple", "erotic",
];

/// Text fields of a submission that go through the gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostText<'a> {
    /// Post title or clip caption.
    pub title: &'a str,
    /// Free-form description.
    pub description: &'a str,
    /// Hashtags, with or without the leading `#`.
    pub hashtags: &'a [String],
}

impl PostText<'_> {
    fn joined(&self) -> String {
        let mut text = String::with_capacity(
            self.title.len()
                + self.description.len()
                + self.hashtags.iter().map(|t| t.len() + 1).sum::<usize>()
                + 1,
        );
        text.push_str(self.title);
        text.push(' ');
        text.push_str(self.description);
        for tag in self.hashtags {
            text.push(' ');
            text.push_str(tag);
        }
        text
    }
}

/// Precompiled keyword matcher.
#[derive(Debug, Clone)]
pub struct TextGate {
    matcher: Regex,
}

impl TextGate {
    /// Gate over [`DEFAULT_DENYLIST`] only.
    ///
    /// # Errors
    ///
    /// See [`Self::with_terms`].
    pub fn builtin() -> Result<Self> {
        Self::with_terms(DEFAULT_DENYLIST.iter().copied())
    }

    /// Builds a gate over `terms`. Terms are matched literally.
    ///
    /// # Errors
    ///
    /// Returns [`ModerationError::PolicyMisconfigured`] for an empty term
    /// list or an empty term.
    pub fn with_terms<I, S>(terms: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let escaped: Vec<String> = terms
            .into_iter()
            .map(|t| regex::escape(t.as_ref().trim()))
            .collect();

        if escaped.is_empty() || escaped.iter().any(String::is_empty) {
            return Err(ModerationError::PolicyMisconfigured(
                "text denylist must contain non-empty terms".into(),
            ));
        }

        let pattern = format!(r"\b(?:{})\b", escaped.join("|"));
        let matcher = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ModerationError::PolicyMisconfigured(e.to_string()))?;

        Ok(Self { matcher })
    }

    /// Built-in denylist plus `extra` terms from configuration.
    ///
    /// # Errors
    ///
    /// See [`Self::with_terms`].
    pub fn with_extra_terms(extra: &[String]) -> Result<Self> {
        Self::with_terms(
            DEFAULT_DENYLIST
                .iter()
                .map(|t| (*t).to_owned())
                .chain(extra.iter().cloned()),
        )
    }

    /// `true` when no denylisted term appears in `text`.
    #[must_use]
    pub fn moderate_text(&self, text: &PostText<'_>) -> bool {
        match self.first_match(text) {
            Some(term) => {
                debug!(term = %term, "text gate matched denylisted term");
                false
            }
            None => true,
        }
    }

    /// The first denylisted term found in `text`, as written by the user.
    #[must_use]
    pub fn first_match(&self, text: &PostText<'_>) -> Option<String> {
        self.matcher
            .find(&text.joined())
            .map(|m| m.as_str().to_owned())
    }
}
