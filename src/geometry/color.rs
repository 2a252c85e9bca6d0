use regex::Regex;
use std::sync::LazyLock;

// Accepted color forms:
//   #abc                    three digit RGB hex
//   #aabbcc                 six digit RRGGBB hex
//   rgb(255, 255, 255)      rgb decimal triplet
//   rgba(255, 255, 255, 1)  rgba quad with alpha in [0-1]
static COLOR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#[0-9a-fA-F]{3,6}|rgb\(\d+,\s*\d+,\s*\d+\)|rgba\(\d+,\s*\d+,\s*\d+,\s*(\d?\.|)\d+\))$")
        .expect("color pattern must parse")
});

pub fn is_valid_color(text: &str) -> bool {
    COLOR_REGEX.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_forms() {
        assert!(is_valid_color("#abc"));
        assert!(is_valid_color("#AABBCC"));
        assert!(is_valid_color("rgb(255, 0, 0)"));
        assert!(is_valid_color("rgb(255,0,0)"));
        assert!(is_valid_color("rgba(255, 0, 0, 1)"));
        assert!(is_valid_color("rgba(0, 0, 0, 0.25)"));
        assert!(is_valid_color("rgba(0, 0, 0, .5)"));
    }

    #[test]
    fn rejected_forms() {
        assert!(!is_valid_color("red"));
        assert!(!is_valid_color("#ab"));
        assert!(!is_valid_color("#abcdefg"));
        assert!(!is_valid_color("rgb(255, 0)"));
        assert!(!is_valid_color("rgba(255, 0, 0)"));
        assert!(!is_valid_color("hsl(0, 0%, 0%)"));
    }
}
