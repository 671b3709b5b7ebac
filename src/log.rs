use log::LevelFilter;
use std::fs::OpenOptions;
use std::path::Path;

/// Install an `env_logger` writing to `file` (or stderr) at `level`.
///
/// Sessions never log through the DAP stream, so stdio mode keeps stdout clean.
pub fn init(file: Option<&Path>, level: LevelFilter) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp_millis();
    if let Some(path) = file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}
