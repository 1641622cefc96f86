//! Command line tokenizing and number parsing

/// Characters separating arguments
pub const WHITESPACE: &[char] = &['\t', '\r', '\n', ' '];

/// Size of the argument vector; one slot is kept for the terminator
pub const MAX_ARGS: usize = 16;

/// The line held more than `MAX_ARGS - 1` arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyArgs;

/// Split `line` into arguments
pub fn tokenize(line: &str) -> Result<Vec<&str>, TooManyArgs> {
    let mut argv = Vec::new();
    for arg in line.split(WHITESPACE).filter(|arg| !arg.is_empty()) {
        if argv.len() == MAX_ARGS - 1 {
            return Err(TooManyArgs);
        }
        argv.push(arg);
    }
    Ok(argv)
}

/// Parse an integer the way C `strtol(s, NULL, 0)` does on a 32-bit machine
///
/// Leading blanks and a sign are accepted; `0x` selects hex, a leading `0`
/// octal, anything else decimal. Parsing stops at the first character that
/// is not a digit of the base. Overflow wraps, and the result is taken as
/// an unsigned 32-bit value.
pub fn strtol(s: &str) -> u32 {
    let mut s = s.trim_start_matches(&[' ', '\t'][..]);

    let negative = match s.as_bytes().first() {
        Some(b'-') => {
            s = &s[1..];
            true
        }
        Some(b'+') => {
            s = &s[1..];
            false
        }
        _ => false,
    };

    let base = if let Some(hex) = s.strip_prefix("0x") {
        s = hex;
        16
    } else if let Some(oct) = s.strip_prefix('0') {
        s = oct;
        8
    } else {
        10
    };

    let mut value: u32 = 0;
    for c in s.chars() {
        let Some(digit) = c.to_digit(36).filter(|&d| d < base) else {
            break;
        };
        value = value.wrapping_mul(base).wrapping_add(digit);
    }

    if negative {
        value.wrapping_neg()
    } else {
        value
    }
}
