pub const EVAL_SUMMARY_PREFIX: &str = "[EVAL][SUMMARY] ";

/// Ordered `key=value` pairs from an evaluation summary line.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EvalSummary {
    pub fields: Vec<(String, String)>,
}

impl EvalSummary {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Parses `[EVAL][SUMMARY] wins=3 losses=1 end_reasons={'turn_limit': 4}`.
///
/// Values run until the next ` key=` token, so they may contain spaces. Returns `None` for lines
/// without the prefix.
pub fn parse_eval_summary(line: &str) -> Option<EvalSummary> {
    let payload = line.trim().strip_prefix(EVAL_SUMMARY_PREFIX.trim_end())?;
    let payload = payload.trim_start();

    let starts = key_starts(payload);
    let mut fields = Vec::with_capacity(starts.len());
    for (index, &(key_start, eq)) in starts.iter().enumerate() {
        let value_end = starts
            .get(index + 1)
            .map(|&(next, _)| next)
            .unwrap_or(payload.len());
        let key = &payload[key_start..eq];
        let value = payload[eq + 1..value_end].trim();
        fields.push((key.to_string(), value.to_string()));
    }
    Some(EvalSummary { fields })
}

// (key start, '=' position) for every identifier directly followed by '=' that starts the payload
// or follows whitespace.
fn key_starts(payload: &str) -> Vec<(usize, usize)> {
    let bytes = payload.as_bytes();
    let mut starts = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let at_boundary = i == 0 || bytes[i - 1].is_ascii_whitespace();
        if at_boundary && is_key_byte(bytes[i]) {
            let mut end = i;
            while end < bytes.len() && is_key_byte(bytes[end]) {
                end += 1;
            }
            if bytes.get(end) == Some(&b'=') {
                starts.push((i, end));
                i = end + 1;
                continue;
            }
            i = end;
            continue;
        }
        i += 1;
    }
    starts
}

fn is_key_byte(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}
