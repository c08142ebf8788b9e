use compact_str::CompactString;

pub fn modulus<T: num_traits::Float>(a: T, b: T) -> T {
    if a.is_sign_positive() == b.is_sign_positive() { a % b } else { b + (a % -b) }
}

/// Checks if the string is shaped like an identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Removes inline formatting codes (`&x` and `§x` pairs) that world editors allow in label text.
pub fn strip_formatting(s: &str) -> CompactString {
    let mut res = CompactString::default();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '&' | '§' => match chars.clone().next() {
                Some(code) if code.is_ascii_alphanumeric() => { chars.next(); }
                _ => res.push(c),
            }
            _ => res.push(c),
        }
    }
    res
}

/// A label line is decorative if, once formatting is removed, it has no alphanumeric content (e.g., `----` or `* * *`).
pub fn is_decorative(line: &str) -> bool {
    !strip_formatting(line).chars().any(char::is_alphanumeric)
}

#[test]
fn test_modulus() {
    assert_eq!(modulus(7.0, 3.0), 1.0);
    assert_eq!(modulus(-7.0, 3.0), 2.0);
    assert_eq!(modulus(7.0, -3.0), -2.0);
    assert_eq!(modulus(-7.0, -3.0), -1.0);
}

#[test]
fn test_identifiers() {
    assert!(is_identifier("x"));
    assert!(is_identifier("_tmp2"));
    assert!(is_identifier("giveReward"));
    assert!(!is_identifier(""));
    assert!(!is_identifier("2fast"));
    assert!(!is_identifier("has space"));
    assert!(!is_identifier("dash-name"));
}

#[test]
fn test_label_lines() {
    assert_eq!(strip_formatting("&aSet &lVar"), "Set Var");
    assert_eq!(strip_formatting("§6gold"), "gold");
    assert_eq!(strip_formatting("salt & pepper"), "salt & pepper");
    assert_eq!(strip_formatting("50%&"), "50%&");
    assert!(is_decorative(""));
    assert!(is_decorative("  ----  "));
    assert!(is_decorative("&6* * *"));
    assert!(!is_decorative("&6set"));
}
