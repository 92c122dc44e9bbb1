const EPISODE_KEY: &str = "ep=";

/// A progress counter pulled out of one line of script output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProgressReading {
    pub current: u64,
    pub total: u64,
}

/// Detects a progress counter in `line`.
///
/// An explicit `current/total` counter (as printed by progress bars, e.g. `42/100`) wins over an
/// `ep=<n>` key; the key form takes its total from `fallback_total`. Counters whose total is zero
/// are skipped and scanning continues past them. Lines without a counter return `None`.
pub fn parse_progress(line: &str, fallback_total: u64) -> Option<ProgressReading> {
    find_counter(line).or_else(|| {
        find_episode_key(line).map(|current| ProgressReading {
            current,
            total: fallback_total,
        })
    })
}

fn find_counter(line: &str) -> Option<ProgressReading> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let left_end = digit_run_end(bytes, i);
        if bytes.get(left_end) != Some(&b'/') {
            i = left_end;
            continue;
        }
        let right_start = left_end + 1;
        let right_end = digit_run_end(bytes, right_start);
        if right_end == right_start {
            i = right_start;
            continue;
        }

        let current = line[i..left_end].parse::<u64>().ok();
        let total = line[right_start..right_end].parse::<u64>().ok();
        if let (Some(current), Some(total)) = (current, total) {
            if total > 0 {
                return Some(ProgressReading { current, total });
            }
        }
        // The right-hand run may itself start the next counter ("0/0/5" style noise).
        i = right_start;
    }
    None
}

fn find_episode_key(line: &str) -> Option<u64> {
    let mut rest = line;
    while let Some(pos) = rest.find(EPISODE_KEY) {
        let after = &rest[pos + EPISODE_KEY.len()..];
        let digits_end = digit_run_end(after.as_bytes(), 0);
        if digits_end > 0 {
            if let Ok(value) = after[..digits_end].parse::<u64>() {
                return Some(value);
            }
        }
        rest = after;
    }
    None
}

fn digit_run_end(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(current: u64, total: u64) -> Option<ProgressReading> {
        Some(ProgressReading { current, total })
    }

    #[test]
    fn parses_episode_key_with_fallback_total() {
        assert_eq!(parse_progress("ep=7", 100), reading(7, 100));
        assert_eq!(parse_progress("[TRAIN] ep=12 reward=3.5", 0), reading(12, 0));
    }

    #[test]
    fn parses_explicit_counter() {
        assert_eq!(parse_progress("step 3/10 done", 0), reading(3, 10));
        assert_eq!(
            parse_progress(" 42%|████      | 42/100 [00:03<00:04]", 7),
            reading(42, 100)
        );
    }

    #[test]
    fn counter_wins_over_episode_key() {
        assert_eq!(parse_progress("ep=5 batch 2/8", 100), reading(2, 8));
    }

    #[test]
    fn zero_total_counter_is_skipped() {
        assert_eq!(parse_progress("0/0 then 4/9", 1), reading(4, 9));
        assert_eq!(parse_progress("warmup 3/0 ep=2", 50), reading(2, 50));
        assert_eq!(parse_progress("3/0", 50), None);
    }

    #[test]
    fn only_first_qualifying_counter_is_used() {
        assert_eq!(parse_progress("1/4 and 2/4", 0), reading(1, 4));
    }

    #[test]
    fn requires_digits_on_both_sides_of_the_slash() {
        assert_eq!(parse_progress("path models/12", 0), None);
        assert_eq!(parse_progress("12/ models", 0), None);
    }

    #[test]
    fn episode_key_needs_digits() {
        assert_eq!(parse_progress("ep=? ep=9", 3), reading(9, 3));
        assert_eq!(parse_progress("ep=", 3), None);
    }

    #[test]
    fn non_matching_lines_return_none() {
        assert_eq!(parse_progress("no numbers here", 50), None);
        assert_eq!(parse_progress("", 50), None);
    }
}
