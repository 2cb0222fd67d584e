use std::io::{self, Write};

use anyhow::{Context, Result};
use serde::Serialize;

/// Writes `value` to stdout as pretty JSON followed by a newline.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    write_json(&mut writer, value)
}

pub fn write_json<T: Serialize>(writer: &mut dyn Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, value).context("failed to serialize output")?;
    writer
        .write_all(b"\n")
        .context("failed to finalize output")?;
    writer.flush().context("failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryResult;

    #[test]
    fn query_results_are_tagged_json() {
        let mut buffer = Vec::new();
        write_json(&mut buffer, &QueryResult::Count(3)).expect("write");
        let text = String::from_utf8(buffer).expect("utf8");
        assert_eq!(text, "{\n  \"kind\": \"count\",\n  \"value\": 3\n}\n");
    }
}
