//! Build script for generating the `tether` man pages.
//!
//! Writes `tether.1` plus one `tether-<command>.1` page per subcommand into
//! the build output directory using clap-mangen.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    for subcommand in command.get_subcommands() {
        let name = format!("tether-{}", subcommand.get_name());
        let path = out_dir.join(format!("{name}.1"));
        render(Man::new(subcommand.clone()).title(name), &path)?;
    }
    render(Man::new(command), &out_dir.join("tether.1"))
}

fn render(man: Man, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    File::create(path)?.write_all(&buffer)?;
    Ok(())
}
