//! Tab-separated power/on-off datalog writer.
//!
//! One line per report: `unix_time_s (2 dp) <TAB> device_mac <TAB>
//! {"1"|"0"|""} <TAB> {"%.1f"|""}`. Flushed after every line so a reader
//! tailing the file never sees a partial write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::mac::Mac;

/// Errors opening or writing the datalog file.
#[derive(Error, Debug)]
pub enum DatalogError {
    #[error("failed to open datalog {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write datalog entry: {0}")]
    Write(#[source] std::io::Error),
}

/// Appends tab-separated report lines to a file, flushing after each write.
pub struct Datalog {
    file: File,
}

impl Datalog {
    /// Open (creating if necessary) the datalog file for appending.
    pub fn open(path: &Path) -> Result<Self, DatalogError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| DatalogError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Datalog { file })
    }

    /// Append one report line and flush.
    pub fn report(
        &mut self,
        unix_time_s: f64,
        mac: Mac,
        is_on: Option<bool>,
        power_w: Option<f64>,
    ) -> Result<(), DatalogError> {
        let is_on_field = match is_on {
            Some(true) => "1",
            Some(false) => "0",
            None => "",
        };
        let power_field = match power_w {
            Some(p) => format!("{p:.1}"),
            None => String::new(),
        };

        writeln!(
            self.file,
            "{:.2}\t{mac}\t{is_on_field}\t{power_field}",
            unix_time_s
        )
        .map_err(DatalogError::Write)?;
        self.file.flush().map_err(DatalogError::Write)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn writes_tab_separated_line() {
        let dir = std::env::temp_dir().join(format!("asoka-datalog-test-{}", std::process::id()));
        let mut log = Datalog::open(&dir).unwrap();
        let mac = Mac::from_bytes([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        log.report(1700000000.123, mac, Some(true), Some(12.34)).unwrap();
        log.report(1700000001.0, mac, None, None).unwrap();

        let mut contents = String::new();
        File::open(&dir).unwrap().read_to_string(&mut contents).unwrap();
        std::fs::remove_file(&dir).ok();

        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "1700000000.12\taa:bb:cc:dd:ee:ff\t1\t12.3");
        assert_eq!(lines[1], "1700000001.00\taa:bb:cc:dd:ee:ff\t\t");
    }
}
