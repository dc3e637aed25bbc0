use std::{fs::File, io::{BufRead, BufReader}, path::Path};

use crate::TuneError;

#[derive(Debug, Clone, PartialEq)]
pub struct TestPosition {
    pub position_text: String,
    /// 1.0 for a first-player win, 0.0 for a second-player win, 0.5 for a draw.
    pub label: f64,
    /// Engine score from the latest pass.
    pub score: i32,
}

impl TestPosition {
    pub fn new(position_text: impl Into<String>, label: f64) -> Self {
        TestPosition { position_text: position_text.into(), label, score: 0 }
    }
}

pub fn parse_result(token: &str) -> Option<f64> {
    match token {
        "1-0" | "1" | "1.0" => Some(1.0),
        "0-1" | "0" | "0.0" => Some(0.0),
        "1/2" | "1/2-1/2" | "0.5" => Some(0.5),
        _ => None,
    }
}

/// Reads `<position text> <result>` lines. Sample line:
/// `rnbqkb1r/1p2ppp1/p2p1n2/2pP3p/4P3/5N2/PPP1QPPP/RNB1KB1R w KQkq - 0 1 1-0`
pub fn read_positions<R: BufRead>(reader: R) -> Result<Vec<TestPosition>, TuneError> {
    let mut positions = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = n + 1;
        let Some((text, token)) = line.rsplit_once(char::is_whitespace) else {
            return Err(TuneError::Corpus { line: line_no, reason: "missing result token".to_string() });
        };
        let label = parse_result(token).ok_or_else(|| TuneError::Corpus {
            line: line_no,
            reason: format!("unknown result '{token}'"),
        })?;
        positions.push(TestPosition::new(text.trim_end(), label));
    }
    if positions.is_empty() {
        return Err(TuneError::EmptyCorpus);
    }
    Ok(positions)
}

pub fn read_position_file(path: &Path) -> Result<Vec<TestPosition>, TuneError> {
    let file = File::open(path).map_err(|source| TuneError::Read { path: path.to_path_buf(), source })?;
    read_positions(BufReader::new(file))
}
