use std::{fs::File, io::Write, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use minicat::{
    archive::{nested::NestedArchives, zip::ZipFileManifest},
    cataloger::{DigestAlgorithm, DigestsCataloger},
    config::SearchConfig,
    source::{FileResolver, Location, Scope, Source},
};

/// minicat
#[derive(Debug, Parser)]
#[clap(name = "minicat", version)]
pub struct App {
    /// search configuration (TOML); defaults apply when absent
    #[clap(long)]
    config: Option<PathBuf>,
    /// which view of an image to search, overriding the configuration
    #[clap(long)]
    scope: Option<Scope>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lists the files of a source, optionally only those matching the given globs
    Files {
        /// `dir:<path>`, `file:<path>`, `oci-dir:<path>` or a path to detect
        source: String,
        #[clap(long)]
        glob: Vec<String>,
    },
    /// Writes the content of a file to stdout
    Cat { source: String, path: String },
    /// Shows the metadata of a file
    Stat { source: String, path: String },
    /// Prints the digests of every regular file
    Digests {
        source: String,
        #[clap(long, default_value = "sha256")]
        algorithm: Vec<DigestAlgorithm>,
    },
    /// Lists the members of a zip archive
    Manifest {
        archive: PathBuf,
        #[clap(long)]
        glob: Vec<String>,
    },
    /// Finds files inside (nested) archives and prints their virtual paths
    Nested {
        archive: PathBuf,
        #[clap(long, required = true)]
        want: Vec<String>,
    },
}

fn describe(location: &Location) -> String {
    match (location.file_system_id(), &location.virtual_path) {
        ("", None) => location.real_path().to_string(),
        ("", Some(virtual_path)) => format!("{} -> {}", virtual_path, location.real_path()),
        (layer, None) => format!("{}\t{layer}", location.real_path()),
        (layer, Some(virtual_path)) => {
            format!("{} -> {}\t{layer}", virtual_path, location.real_path())
        }
    }
}

fn lookup(resolver: &dyn FileResolver, path: &str) -> Result<Location> {
    match resolver.files_by_path(&[path])?.into_iter().next() {
        Some(location) => Ok(location),
        None => bail!("No such file: {path}"),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let mut config = match &args.config {
        Some(path) => SearchConfig::load(path)?,
        None => SearchConfig::default(),
    };
    if let Some(scope) = args.scope {
        config.scope = scope;
    }

    match args.cmd {
        Command::Files {
            ref source,
            ref glob,
        } => {
            let source = Source::detect(source)?;
            let resolver = source.file_resolver(config.scope)?;
            if glob.is_empty() {
                for location in resolver.all_locations() {
                    println!("{}", describe(&location));
                }
            } else {
                let patterns: Vec<&str> = glob.iter().map(String::as_str).collect();
                for location in resolver.files_by_glob(&patterns)? {
                    println!("{}", describe(&location));
                }
            }
        }
        Command::Cat {
            ref source,
            ref path,
        } => {
            let source = Source::detect(source)?;
            let resolver = source.file_resolver(config.scope)?;
            let location = lookup(&*resolver, path)?;
            let mut reader = resolver.file_contents_by_location(&location)?;
            let mut stdout = std::io::stdout().lock();
            std::io::copy(&mut reader, &mut stdout)?;
            stdout.flush()?;
        }
        Command::Stat {
            ref source,
            ref path,
        } => {
            let source = Source::detect(source)?;
            let resolver = source.file_resolver(config.scope)?;
            let location = lookup(&*resolver, path)?;
            let metadata = resolver.file_metadata_by_location(&location)?;
            println!("location {}", describe(&location));
            println!("type     {}", metadata.file_type);
            println!("mode     {:04o}", metadata.mode);
            println!("owner    {}:{}", metadata.user_id, metadata.group_id);
            println!("size     {}", metadata.size);
            if !metadata.link_destination.is_empty() {
                println!("link     {}", metadata.link_destination);
            }
            if !metadata.mime_type.is_empty() {
                println!("mime     {}", metadata.mime_type);
            }
        }
        Command::Digests {
            ref source,
            ref algorithm,
        } => {
            let source = Source::detect(source)?;
            let resolver = source.file_resolver(config.scope)?;
            let cataloger = DigestsCataloger::new(algorithm.clone());
            for (coordinates, digests) in cataloger.catalog(&*resolver)? {
                for digest in digests {
                    println!("{}:{}  {coordinates}", digest.algorithm, digest.value);
                }
            }
        }
        Command::Manifest {
            ref archive,
            ref glob,
        } => {
            let manifest = ZipFileManifest::new(archive)
                .with_context(|| format!("Failed to read zip manifest of {archive:?}"))?;
            let names: Vec<String> = match glob.is_empty() {
                true => manifest.iter().map(|(name, _)| name.to_string()).collect(),
                false => manifest.glob_match(glob),
            };
            for name in names {
                let size = manifest.get(&name).map_or(0, |info| info.size);
                println!("{size:>12} {name}");
            }
        }
        Command::Nested {
            ref archive,
            ref want,
        } => {
            let file =
                File::open(archive).with_context(|| format!("Failed to open {archive:?}"))?;
            let nested = NestedArchives::new(&config)?;
            let wanted: Vec<&str> = want.iter().map(String::as_str).collect();
            for found in nested.discover(&archive.to_string_lossy(), file, &wanted)? {
                println!("{}", found.location.access_path());
            }
        }
    }
    Ok(())
}
