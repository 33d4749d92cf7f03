//! Terminal and JSON-lines rendering.

use std::io::{self, Write};

use serde::Serialize;

use taskrun_core::TaskSpec;
use taskrun_engine::{OutputStream, ResolvedImage, TaskEvent};

/// Print one event. Task output goes to stdout/stderr as written; state
/// changes are already logged, so in human mode they are not repeated.
pub fn print_event(event: &TaskEvent, json: bool) -> io::Result<()> {
    if json {
        return print_json(event);
    }
    match event {
        TaskEvent::Output {
            stream: OutputStream::Stdout,
            line,
        } => writeln!(io::stdout().lock(), "{line}"),
        TaskEvent::Output {
            stream: OutputStream::Stderr,
            line,
        } => writeln!(io::stderr().lock(), "{line}"),
        TaskEvent::StateChanged { .. } => Ok(()),
    }
}

#[derive(Serialize)]
struct ImageLine<'a> {
    reference: String,
    digest: &'a str,
    rootfs: &'a std::path::Path,
    fetched_at: String,
}

pub fn print_image(image: &ResolvedImage, json: bool) -> io::Result<()> {
    if json {
        return print_json(&ImageLine {
            reference: image.reference.to_string(),
            digest: &image.digest,
            rootfs: &image.rootfs,
            fetched_at: image.fetched_at.to_rfc3339(),
        });
    }
    writeln!(
        io::stdout().lock(),
        "{:<40}  {}  {}",
        image.reference.to_string(),
        image.digest,
        image.fetched_at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn print_spec(spec: &TaskSpec) {
    println!("platform: {}", spec.platform);
    println!("image:    {}", spec.image);
    println!(
        "run:      {} {}",
        spec.run.executable.display(),
        spec.run.args.join(" ")
    );
    if !spec.run.working_dir.as_os_str().is_empty() {
        println!("dir:      {}", spec.run.working_dir.display());
    }
    for binding in spec.bindings() {
        println!(
            "{:<7} {:<20} {} -> {}{}",
            binding.kind.to_string(),
            binding.name,
            binding.host_path.display(),
            binding.container_path.display(),
            if binding.optional { " (optional)" } else { "" }
        );
    }
    for (key, value) in &spec.params {
        println!("param   {key}={value}");
    }
}

fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
    let json = serde_json::to_string(value).map_err(io::Error::other)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{json}")?;
    stdout.flush()
}
