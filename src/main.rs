pub mod application;
pub mod camera;
pub mod headless;

use std::path::PathBuf;

use anyhow::{bail, Context};
use renderer::config::RendererConfig;
use renderer::logging::{init_logging, LoggingConfig};
use renderer::pipeline::exports;
use renderer::shaders::ShaderLibrary;

struct Arguments {
    config: Option<PathBuf>,
    headless_frames: Option<u32>,
    dump: Option<PathBuf>,
}

fn parse_arguments(args: &[String]) -> anyhow::Result<Arguments> {
    let mut arguments = Arguments {
        config: None,
        headless_frames: None,
        dump: None,
    };
    let mut args = args.iter().skip(1);
    while let Some(arg) = args.next() {
        let mut value = || {
            args.next()
                .with_context(|| format!("{} expects a value", arg))
        };
        match arg.as_str() {
            "--config" => arguments.config = Some(PathBuf::from(value()?)),
            "--headless" => {
                let frames = value()?;
                arguments.headless_frames = Some(
                    frames
                        .parse()
                        .with_context(|| format!("invalid frame count {}", frames))?,
                );
            }
            "--dump" => arguments.dump = Some(PathBuf::from(value()?)),
            other => bail!(
                "unknown argument {}\nusage: tracey [--config <file>] [--headless <frames>] [--dump <png>]",
                other
            ),
        }
    }
    Ok(arguments)
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let arguments = parse_arguments(&args)?;

    let mut config = match &arguments.config {
        Some(path) => RendererConfig::load(path)?,
        None => RendererConfig::default(),
    };
    if let Some(dump) = arguments.dump {
        config.headless.dump = Some(dump);
    }

    match arguments.headless_frames {
        Some(frames) => {
            config.headless.frames = frames;
            headless::run(config)
        }
        None => {
            let shaders = ShaderLibrary::load(&config.shader_dir, &exports::SHADERS)
                .with_context(|| format!("loading shaders from {}", config.shader_dir.display()))?;
            application::run(config, shaders)
        }
    }
}

/// Every error ends the process; there is no recovery path.
fn report_fatal(error: anyhow::Error) -> ! {
    log::error!("{:?}", error);
    std::process::exit(1)
}

fn main() {
    init_logging(LoggingConfig::default());
    if let Err(error) = run() {
        report_fatal(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tracey")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_headless_run_with_dump() {
        let arguments =
            parse_arguments(&args(&["--headless", "12", "--dump", "out.png"])).unwrap();
        assert_eq!(arguments.headless_frames, Some(12));
        assert_eq!(arguments.dump, Some(PathBuf::from("out.png")));
        assert!(arguments.config.is_none());
    }

    #[test]
    fn rejects_unknown_and_incomplete_arguments() {
        assert!(parse_arguments(&args(&["--fast"])).is_err());
        assert!(parse_arguments(&args(&["--config"])).is_err());
        assert!(parse_arguments(&args(&["--headless", "many"])).is_err());
    }
}
