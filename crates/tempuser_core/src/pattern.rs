use regex::Regex;
use tracing::warn;

use crate::error::TempUserError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Serial,
    Year,
}

/// A username template such as `~$1` or `~$2-$1`. `$1` is the serial id
/// and appears exactly once; `$2` is the year and appears at most once.
#[derive(Debug, Clone)]
pub struct Pattern {
    debug_name: String,
    template: String,
    segments: Vec<Segment>,
    matcher: Regex,
}

/// A `LIKE` condition selecting names a pattern could have produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeCondition {
    pub sql: String,
    pub value: String,
}

impl Pattern {
    /// `debug_name` is the configuration key the template came from and only
    /// appears in error messages.
    pub fn new(debug_name: &str, template: &str) -> Result<Self, TempUserError> {
        let segments = parse_segments(template);
        let serial_slots = segments.iter().filter(|s| **s == Segment::Serial).count();
        let year_slots = segments.iter().filter(|s| **s == Segment::Year).count();
        if serial_slots == 0 {
            return Err(TempUserError::invalid_pattern(
                debug_name,
                format!("\"{template}\" does not contain $1"),
            ));
        }
        if serial_slots > 1 {
            return Err(TempUserError::invalid_pattern(
                debug_name,
                format!("\"{template}\" contains $1 more than once"),
            ));
        }
        if year_slots > 1 {
            return Err(TempUserError::invalid_pattern(
                debug_name,
                format!("\"{template}\" contains $2 more than once"),
            ));
        }

        let matcher = Regex::new(&build_regex(&segments)).map_err(|err| {
            TempUserError::invalid_pattern(debug_name, format!("failed to compile matcher: {err}"))
        })?;

        Ok(Self {
            debug_name: debug_name.to_string(),
            template: template.to_string(),
            segments,
            matcher,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn has_year_placeholder(&self) -> bool {
        self.segments.contains(&Segment::Year)
    }

    /// Expand the template.
    ///
    /// A year supplied to a template without `$2` is prefixed to the serial
    /// as `{year}-{serial}`. A template with `$2` and no year gets an empty
    /// string in that slot.
    pub fn generate(&self, serial_id: &str, year: Option<&str>) -> String {
        let year_slot = self.has_year_placeholder();
        if year_slot && year.is_none() {
            warn!(
                pattern = %self.debug_name,
                template = %self.template,
                "year placeholder expanded without a year"
            );
        }

        let mut out = String::with_capacity(self.template.len() + serial_id.len() + 5);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Serial => {
                    if let (false, Some(year)) = (year_slot, year) {
                        out.push_str(year);
                        out.push('-');
                    }
                    out.push_str(serial_id);
                }
                Segment::Year => out.push_str(year.unwrap_or_default()),
            }
        }
        out
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }

    /// Return the text standing in the `$1` position, if `name` matches.
    pub fn extract(&self, name: &str) -> Option<String> {
        self.matcher
            .captures(name)
            .and_then(|caps| caps.name("serial"))
            .map(|m| m.as_str().to_string())
    }

    /// Literal text before the first placeholder.
    pub fn prefix(&self) -> &str {
        match self.segments.first() {
            Some(Segment::Literal(text)) => text,
            _ => "",
        }
    }

    /// Literal text after the last placeholder.
    pub fn suffix(&self) -> &str {
        match self.segments.last() {
            Some(Segment::Literal(text)) if self.segments.len() > 1 => text,
            _ => "",
        }
    }

    /// Build a `LIKE` condition on `column`, escaping with a backslash.
    pub fn like_condition(&self, column: &str) -> LikeCondition {
        let mut value = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => {
                    for ch in text.chars() {
                        if matches!(ch, '%' | '_' | '\\') {
                            value.push('\\');
                        }
                        value.push(ch);
                    }
                }
                Segment::Serial | Segment::Year => {
                    if !value.ends_with('%') || value.ends_with("\\%") {
                        value.push('%');
                    }
                }
            }
        }
        LikeCondition {
            sql: format!("{column} LIKE ? ESCAPE '\\'"),
            value,
        }
    }
}

fn parse_segments(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let placeholder = match after.as_bytes().first() {
            Some(b'1') => Some(Segment::Serial),
            Some(b'2') => Some(Segment::Year),
            _ => None,
        };
        match placeholder {
            Some(segment) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(segment);
                rest = &after[1..];
            }
            None => {
                literal.push('$');
                rest = after;
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn build_regex(segments: &[Segment]) -> String {
    let mut source = String::from("(?s)^");
    for segment in segments {
        match segment {
            Segment::Literal(text) => source.push_str(&regex::escape(text)),
            Segment::Serial => source.push_str("(?P<serial>.*)"),
            Segment::Year => source.push_str("(?P<year>.*)"),
        }
    }
    source.push('$');
    source
}

#[cfg(test)]
mod tests {
    use super::Pattern;
    use crate::error::TempUserError;

    #[test]
    fn rejects_templates_without_serial_placeholder() {
        let err = Pattern::new("genPattern", "~temp").expect_err("must fail");
        assert!(matches!(err, TempUserError::InvalidPattern { .. }));
        assert!(err.to_string().contains("does not contain $1"));
    }

    #[test]
    fn rejects_repeated_placeholders() {
        assert!(Pattern::new("genPattern", "~$1-$1").is_err());
        assert!(Pattern::new("genPattern", "$2~$2-$1").is_err());
    }

    #[test]
    fn generates_plain_serial_names() {
        let pattern = Pattern::new("genPattern", "~2$1").expect("pattern");
        assert_eq!(pattern.generate("1", None), "~21");
        assert_eq!(pattern.generate("12345", None), "~212345");
    }

    #[test]
    fn generates_year_names_with_and_without_placeholder() {
        let explicit = Pattern::new("genPattern", "~$2-$1").expect("pattern");
        assert_eq!(explicit.generate("77", Some("2024")), "~2024-77");
        assert_eq!(explicit.generate("77", None), "~-77");

        let implicit = Pattern::new("genPattern", "~$1").expect("pattern");
        assert_eq!(implicit.generate("77", Some("2024")), "~2024-77");
    }

    #[test]
    fn matches_generated_names_only() {
        let pattern = Pattern::new("matchPattern", "~2$1").expect("pattern");
        assert!(pattern.is_match("~2123"));
        assert!(!pattern.is_match("User123"));
        assert!(!pattern.is_match("x~2123"));
    }

    #[test]
    fn generated_names_round_trip_through_matcher() {
        let pattern = Pattern::new("genPattern", "*Unregistered $2 ($1)").expect("pattern");
        for (serial, year) in [("1", "2023"), ("abc", "2024"), ("9-9", "1999")] {
            let name = pattern.generate(serial, Some(year));
            assert!(pattern.is_match(&name), "{name} should match");
            assert_eq!(pattern.extract(&name).as_deref(), Some(serial));
        }
    }

    #[test]
    fn literal_dollars_and_regex_metacharacters_are_preserved() {
        let pattern = Pattern::new("genPattern", "$x.(*)$1").expect("pattern");
        let name = pattern.generate("5", None);
        assert_eq!(name, "$x.(*)5");
        assert!(pattern.is_match(&name));
        assert!(!pattern.is_match("$xa(*)5"));
    }

    #[test]
    fn exposes_prefix_suffix_and_like_condition() {
        let pattern = Pattern::new("matchPattern", "~_$1%").expect("pattern");
        assert_eq!(pattern.prefix(), "~_");
        assert_eq!(pattern.suffix(), "%");
        let like = pattern.like_condition("user_name");
        assert_eq!(like.sql, "user_name LIKE ? ESCAPE '\\'");
        assert_eq!(like.value, "~\\_%\\%");

        let bare = Pattern::new("matchPattern", "$1").expect("pattern");
        assert_eq!(bare.prefix(), "");
        assert_eq!(bare.suffix(), "");
        assert_eq!(bare.like_condition("n").value, "%");
    }
}
