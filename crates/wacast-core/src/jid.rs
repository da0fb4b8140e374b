//! Phone-number normalization and WhatsApp JID mapping.
//!
//! Numbers are stored as bare digit strings (`62812xxxx`, no `+`). A
//! leading `0` is rewritten to the `62` country prefix.

/// Strip non-digits and apply the `0` → `62` prefix rule. Returns `None`
/// for inputs shorter than 8 digits.
pub fn normalize_number(input: &str) -> Option<String> {
    let raw = input.trim();
    if raw.is_empty() {
        return None;
    }

    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix('0') {
        digits = format!("62{rest}");
    }

    if digits.len() < 8 {
        return None;
    }
    Some(digits)
}

/// Map an already-normalized number to its WhatsApp JID.
pub fn number_to_jid(number: &str) -> String {
    format!("{number}@s.whatsapp.net")
}

/// Parse a free-form list of numbers (newline/comma/semicolon/space
/// separated), normalized and de-duplicated in input order.
pub fn parse_number_list(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for part in text.split(|c: char| c == '\n' || c == ',' || c == ';' || c.is_whitespace()) {
        if let Some(n) = normalize_number(part) {
            if seen.insert(n.clone()) {
                out.push(n);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number("0812-3456-789"), Some("628123456789".into()));
        assert_eq!(normalize_number("+62 812 3456 789"), Some("628123456789".into()));
        assert_eq!(normalize_number("123"), None);
        assert_eq!(normalize_number("   "), None);
    }

    #[test]
    fn test_number_to_jid() {
        assert_eq!(number_to_jid("628123456789"), "628123456789@s.whatsapp.net");
    }

    #[test]
    fn test_parse_number_list_dedups() {
        let list = parse_number_list("08123456789, +628123456789\n62811111111;junk");
        assert_eq!(list, vec!["628123456789".to_string(), "62811111111".to_string()]);
    }
}
