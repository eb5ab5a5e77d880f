use derive_more::Display;
use std::cmp::Ordering;

/// Version of a pacman packet.
///
/// Syntax: `{epoch?}:{pkgver}-{pkgrel}`
///
/// Examples: `1.0-1`, `2:6.0.19-1`, `20240101-2`
///
/// The ordering implements the package manager's own comparison rules, not
/// semver: an integer epoch before `:` dominates everything after it, the
/// rest is split into segments at runs of non-alphanumeric characters,
/// digit segments compare numerically and other segments lexicographically,
/// and when all compared segments are equal the version with more segments
/// is the greater one.
#[derive(Debug, Display, Clone)]
pub struct Version(String);

impl Version {
    /// Construct a [`Version`] from its textual form.
    pub fn new(text: impl Into<String>) -> Self {
        Version(text.into())
    }

    /// The textual form as it appears in filenames.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The epoch part, or 0 when the version carries none.
    pub fn epoch(&self) -> u64 {
        split_epoch(&self.0).0
    }
}

impl From<&str> for Version {
    fn from(text: &str) -> Self {
        Version::new(text)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let (epoch_a, rest_a) = split_epoch(&self.0);
        let (epoch_b, rest_b) = split_epoch(&other.0);
        epoch_a.cmp(&epoch_b).then_with(|| compare_segments(rest_a, rest_b))
    }
}

/// Split the integer epoch off a version string. A `:` only introduces an
/// epoch when everything before it is a digit sequence.
fn split_epoch(text: &str) -> (u64, &str) {
    match text.split_once(':') {
        Some((epoch, rest)) if !epoch.is_empty() && epoch.bytes().all(|b| b.is_ascii_digit()) => {
            (epoch.parse().unwrap_or(u64::MAX), rest)
        }
        _ => (0, text),
    }
}

fn segments(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_ascii_alphanumeric()).filter(|segment| !segment.is_empty())
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let mut left = segments(a);
    let mut right = segments(b);
    loop {
        match (left.next(), right.next()) {
            (Some(x), Some(y)) => match compare_segment(x, y) {
                Ordering::Equal => continue,
                decided => return decided,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_segment(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if numeric(a) && numeric(b) {
        let a = a.trim_start_matches('0');
        let b = b.trim_start_matches('0');
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    } else {
        a.cmp(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cmp(a: &str, b: &str) -> Ordering {
        Version::new(a).cmp(&Version::new(b))
    }

    #[test]
    fn ordering() {
        macro_rules! case {
            ($a:expr, $b:expr => $expected:expr) => {{
                let (a, b) = ($a, $b);
                eprintln!("CASE: {a:?} vs {b:?}");
                assert_eq!(cmp(a, b), $expected);
                assert_eq!(cmp(b, a), $expected.reverse());
            }};
        }

        case!("1.0-1", "1.0-1" => Ordering::Equal);
        case!("1.0-1", "1.0-2" => Ordering::Less);
        case!("1.0-1", "1.1-1" => Ordering::Less);
        case!("1.9-1", "1.10-1" => Ordering::Less);
        case!("1.0-1", "1.0.1-1" => Ordering::Less);
        case!("2.0-1", "10.0-1" => Ordering::Less);
        case!("1.0a-1", "1.0b-1" => Ordering::Less);
        case!("1.0-1", "01.0-1" => Ordering::Equal);
        case!("1.00-1", "1.0-1" => Ordering::Equal);
    }

    #[test]
    fn epoch_dominates() {
        assert_eq!(cmp("1:0.1-1", "9.9-9"), Ordering::Greater);
        assert_eq!(cmp("2:1.0-1", "1:99.9-1"), Ordering::Greater);
        assert_eq!(cmp("0:1.0-1", "1.0-1"), Ordering::Equal);
    }

    #[test]
    fn colon_without_integer_epoch_is_a_separator() {
        assert_eq!(Version::new("a:1.0-1").epoch(), 0);
        assert_eq!(Version::new("3:1.0-1").epoch(), 3);
    }

    #[test]
    fn equality_follows_the_comparison() {
        assert_eq!(Version::new("1.0-1"), Version::new("1.00-1"));
        assert_ne!(Version::new("1.0-1"), Version::new("1.0-2"));
    }

    #[test]
    fn total_order_on_a_sorted_ladder() {
        let ladder = ["0.9-1", "1.0-1", "1.0.1-1", "1.0a-1", "1.1-1", "2.0-1", "1:0.1-1"];
        for (i, a) in ladder.iter().enumerate() {
            for (j, b) in ladder.iter().enumerate() {
                assert_eq!(cmp(a, b), i.cmp(&j), "{a} vs {b}");
            }
        }
    }
}
