//! JSON reports on standard output.

use std::io::{self, Write};

use serde::Serialize;

use super::error::InfraError;

/// Write `value` as one JSON document followed by a newline.
pub fn write_json<T, W>(writer: &mut W, value: &T, pretty: bool) -> Result<(), InfraError>
where
    T: Serialize + ?Sized,
    W: Write,
{
    if pretty {
        serde_json::to_writer_pretty(&mut *writer, value)?;
    } else {
        serde_json::to_writer(&mut *writer, value)?;
    }
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

pub fn print_json<T>(value: &T, pretty: bool) -> Result<(), InfraError>
where
    T: Serialize + ?Sized,
{
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    write_json(&mut handle, value, pretty)
}
