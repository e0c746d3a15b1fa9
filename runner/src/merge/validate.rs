use crate::{
    arrays::ArrayTool,
    batch::BatchPaths,
    status::RunStatusGrid,
};
use std::{
    collections::BTreeMap,
    io::{self, BufRead, Write},
};
use tracing::{debug, warn};

/// status code -> number of cells over every readable run status file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeSummary {
    pub codes: BTreeMap<i64, usize>,
    pub readable: usize,
    pub unreadable: Vec<usize>,
}

impl CodeSummary {
    pub fn collect(tool: &dyn ArrayTool, batches: &[BatchPaths], sentinel: f64) -> Self {
        let mut summary = Self::default();

        for batch in batches {
            let path = batch.run_status();
            if !path.is_file() {
                debug!(batch = %batch.name(), "No run status file");
                summary.unreadable.push(batch.index);
                continue;
            }

            match RunStatusGrid::load(tool, &path) {
                Ok(grid) => {
                    summary.readable += 1;
                    for (code, count) in grid.codes(sentinel) {
                        *summary.codes.entry(code).or_default() += count;
                    }
                }
                Err(error) => {
                    warn!(error = %error, batch = %batch.name(), "Failed to read run status");
                    summary.unreadable.push(batch.index);
                }
            }
        }

        summary
    }

    /// any code other than `success` was seen
    pub fn needs_confirmation(&self, success: i64) -> bool {
        self.codes.keys().any(|code| *code != success)
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .codes
            .iter()
            .map(|(code, count)| format!("  status {code:>5}: {count} cells"))
            .collect();

        if !self.unreadable.is_empty() {
            lines.push(format!(
                "  {} batches without a readable run status file",
                self.unreadable.len()
            ));
        }

        lines
    }
}

/// Ask a yes/no question, anything but `y`/`yes` is a refusal
pub fn confirm(input: &mut dyn BufRead, output: &mut dyn Write, question: &str) -> io::Result<bool> {
    write!(output, "{question} [y/N] ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::{dataset::tests::grid, NativeTool};
    use ndarray::array;
    use std::io::Cursor;

    #[test]
    fn answers_are_parsed() {
        let mut output = Vec::new();

        for (answer, expected) in [("y\n", true), ("YES\n", true), ("n\n", false), ("\n", false), ("", false)] {
            let mut input = Cursor::new(answer.as_bytes());
            assert_eq!(confirm(&mut input, &mut output, "continue?").unwrap(), expected);
        }

        assert!(String::from_utf8(output).unwrap().starts_with("continue? [y/N] "));
    }

    #[test]
    fn codes_are_summed_across_batches() {
        let root = tempfile::tempdir().unwrap();
        let tool = NativeTool;
        let batches: Vec<BatchPaths> = (0..3).map(|index| BatchPaths::new(root.path(), index)).collect();

        tool.write(
            &grid("run_status", array![[100.0, 100.0], [-1.0, -9999.0]], -9999.0),
            &batches[0].run_status(),
        )
        .unwrap();
        tool.write(
            &grid("run_status", array![[100.0, 0.0], [100.0, 100.0]], -9999.0),
            &batches[2].run_status(),
        )
        .unwrap();

        let summary = CodeSummary::collect(&tool, &batches, -99.0);

        assert_eq!(summary.codes, BTreeMap::from([(-1, 1), (0, 1), (100, 5)]));
        assert_eq!(summary.readable, 2);
        assert_eq!(summary.unreadable, vec![1]);
        assert!(summary.needs_confirmation(100));
    }
}
