use std::io::{SeekFrom, Write};

use clap::Parser;
use ignore::WalkBuilder;
use log::{error, info};

use aff4::acquire;
use aff4::backing;
use aff4::cli::{self, Cli, Commands, Config};
use aff4::crypto;
use aff4::error::{Aff4Error, Result};
use aff4::identity::{self, Identity};
use aff4::resolver::{Mode, Resolver};
use aff4::spill::VolumeSpill;
use aff4::stream::{Reader, Stream};
use aff4::urn::attr;
use aff4::volume;

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aff4: {}", e);
            std::process::exit(2);
        }
    };

    env_logger::Builder::new()
        .filter_level(cli::log_level(cli.verbose.max(config.verbosity)))
        .parse_default_env()
        .init();

    if let Err(e) = run(cli.command, &config) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands, config: &Config) -> Result<()> {
    let resolver = config.resolver();

    match command {
        Commands::Acquire { volume, paths, key } => {
            let uri = backing::to_uri(&volume);
            let spill = VolumeSpill::create(&resolver, &uri, config.max_volume_size)?;
            let mut options = config.image_options();

            if let Some(key) = key {
                let key = crypto::private_key_from_pem(&std::fs::read_to_string(key)?)?;
                let signer = Identity::create(&resolver, &spill.current(), &key)?;
                info!("Signing as {}", signer.urn());
                options.sha256 = true;
            }

            for path in paths {
                let walker = WalkBuilder::new(&path)
                    .follow_links(config.follow_links)
                    .standard_filters(false)
                    .same_file_system(config.same_fs)
                    .sort_by_file_name(|a, b| a.cmp(b))
                    .build();
                for image in acquire::acquire(&resolver, &spill, walker, &options)? {
                    println!("{}", image);
                }
            }
            spill.close()
        }
        Commands::Info { volume } => {
            load(&resolver, &volume)?;
            print!("{}", resolver.export_all());
            Ok(())
        }
        Commands::Ls { volume } => {
            let volume = load(&resolver, &volume)?;
            for urn in resolver.resolve_list(&volume, attr::CONTAINS) {
                println!(
                    "{:<10} {:>14} {}",
                    resolver.resolve(&urn, attr::TYPE).unwrap_or_default(),
                    resolver.resolve(&urn, attr::SIZE).unwrap_or_default(),
                    urn
                );
            }
            Ok(())
        }
        Commands::Cat { volume, urn } => {
            load(&resolver, &volume)?;
            let mut handle = resolver.open(&urn, Mode::Read)?;
            handle.stream()?.seek(SeekFrom::Start(0))?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            std::io::copy(&mut Reader(handle.stream()?), &mut out)?;
            out.flush()?;
            Ok(())
        }
        Commands::Verify { volume } => {
            let volume = load(&resolver, &volume)?;
            let mut problems = 0;
            for id in resolver.resolve_list(&volume, attr::IDENTITY) {
                let checked = identity::verify(&resolver, &id, |d| {
                    println!("{}", d);
                    problems += 1;
                })?;
                println!("{}: {} statements checked", id, checked);
            }
            match problems {
                0 => Ok(()),
                n => Err(Aff4Error::IntegrityError(format!("{} discrepancies", n))),
            }
        }
        Commands::Keygen { out, bits } => {
            let key = crypto::generate_key(bits)?;
            std::fs::write(&out, crypto::private_key_to_pem(&key)?)?;
            println!("{}", identity::identity_urn(&key.to_public_key())?);
            Ok(())
        }
    }
}

fn load(resolver: &Resolver, volume: &str) -> Result<String> {
    volume::load(resolver, &backing::to_uri(volume))
}
