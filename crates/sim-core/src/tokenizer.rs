//! Regex word splitter standing in for a real tokenizer.
//!
//! Each token is a run of non-whitespace plus its trailing whitespace, so
//! concatenating the tokens of a text reproduces it byte for byte.

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+\s*").unwrap());

pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn count(text: &str) -> usize {
    TOKEN_RE.find_iter(text).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_whitespace_delimited_words() {
        assert_eq!(count("This is a test."), 4);
        assert_eq!(count("This is a test message"), 5);
        assert_eq!(count(""), 0);
        assert_eq!(count("   "), 0);
        assert_eq!(count("one"), 1);
    }

    #[test]
    fn tokens_concatenate_back_to_text() {
        let text = "Hello,  world!\nHow are you?";
        let joined: String = tokenize(text).concat();
        assert_eq!(joined, text);
    }

    #[test]
    fn tokens_carry_trailing_whitespace() {
        let toks = tokenize("a b");
        assert_eq!(toks, vec!["a ".to_string(), "b".to_string()]);
    }
}
