use std::{
    fs::{self, File},
    io::{self, Write},
    path::Path,
};

use env_logger::{Builder, Env, Target};

/// Copies every log line to stderr and to the run's log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Installs the process logger: `<timestamp> - <LEVEL> - <message>` lines on
/// stderr and in `log_file` (truncated). `RUST_LOG` overrides the `info`
/// default.
pub fn init(log_file: &Path) -> io::Result<()> {
    if let Some(dir) = log_file.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = File::create(log_file)?;

    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init()
        .map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_writes_through_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");

        let mut tee = Tee {
            file: File::create(&path).unwrap(),
        };
        writeln!(tee, "2024-01-01T00:00:00.000Z - INFO - hello").unwrap();
        tee.flush().unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "2024-01-01T00:00:00.000Z - INFO - hello\n");
    }
}
