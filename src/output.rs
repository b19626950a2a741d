use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write the results to this file rather than the standard output.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the output file at {1:?}")]
    OpenFile(#[source] std::io::Error, PathBuf),
    #[error("could not write to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn into_output(self) -> Result<Output, Error> {
        let io: Box<dyn std::io::Write> = match &self.output {
            None => Box::new(std::io::stdout().lock()),
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenFile(e, path.clone()))?,
            ),
        };
        let sink = match self.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Sink::Table(table)
            }
            Format::Jsonl => Sink::Jsonl,
            Format::Csv => Sink::Csv,
        };
        Ok(Output {
            destination: self.output,
            io,
            sink,
        })
    }
}

/// Streams rows to the requested destination in the requested format.
///
/// Rows are produced lazily in two shapes: a cell vector for the tabular
/// formats and a serde record for jsonl, so commands pay only for the
/// representation the user asked for.
pub struct Output {
    destination: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    sink: Sink,
}

enum Sink {
    Table(comfy_table::Table),
    Jsonl,
    Csv,
}

impl Output {
    pub fn headers(&mut self, columns: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Table(table) => {
                table.set_header(columns);
                Ok(())
            }
            Sink::Jsonl => Ok(()),
            Sink::Csv => write_csv_record(&mut self.io, &columns)
                .map_err(|e| write_error(&self.destination, e)),
        }
    }

    pub fn row<R: serde::Serialize>(
        &mut self,
        cells: impl FnOnce() -> Vec<String>,
        record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Table(table) => {
                table.add_row(cells());
                Ok(())
            }
            Sink::Jsonl => {
                serde_json::to_writer(&mut self.io, &record()).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| write_error(&self.destination, e))
            }
            Sink::Csv => write_csv_record(&mut self.io, &cells())
                .map_err(|e| write_error(&self.destination, e)),
        }
    }

    pub fn finish(mut self) -> Result<(), Error> {
        if let Sink::Table(table) = &self.sink {
            writeln!(self.io, "{table}").map_err(|e| write_error(&self.destination, e))?;
        }
        self.io.flush().map_err(|e| write_error(&self.destination, e))
    }
}

fn write_error(destination: &Option<PathBuf>, e: std::io::Error) -> Error {
    match destination {
        None => Error::WriteStdout(e),
        Some(path) => Error::WriteFile(e, path.clone()),
    }
}

fn write_csv_record(
    io: &mut dyn std::io::Write,
    fields: &[impl AsRef<str>],
) -> std::io::Result<()> {
    let mut writer = csv_core::Writer::new();
    let mut buffer = [0u8; 1024];
    for (index, field) in fields.iter().enumerate() {
        if index != 0 {
            let (_, written) = writer.delimiter(&mut buffer);
            io.write_all(&buffer[..written])?;
        }
        let mut input = field.as_ref().as_bytes();
        loop {
            let (result, consumed, written) = writer.field(input, &mut buffer);
            io.write_all(&buffer[..written])?;
            input = &input[consumed..];
            if matches!(result, csv_core::WriteResult::InputEmpty) && input.is_empty() {
                break;
            }
        }
    }
    let (_, written) = writer.terminator(&mut buffer);
    io.write_all(&buffer[..written])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_escape_fields() {
        let mut buffer = Vec::new();
        write_csv_record(&mut buffer, &["a", "b,c", "d\"e"]).unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), "a,\"b,c\",\"d\"\"e\"\n");
    }
}
