use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use signflow::{
    Config, Credential, ImageComposer, PdfSigner, Position, SigningRequest, TrustStore,
    TrustStoreHandle, Validator,
};

#[derive(Parser)]
#[command(name = "signflow", version, about = "Sign PDFs and validate their signatures")]
struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validates every signature of the given PDFs
    ValidatePdf {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Inspects a PKCS #12 credential
    ValidateP12 {
        file: PathBuf,
        #[arg(long, env = "SIGNFLOW_P12_PASSWORD")]
        password: String,
    },
    /// Signs a PDF with a visible signature
    Sign {
        pdf: PathBuf,
        #[arg(long, value_name = "FILE")]
        p12: PathBuf,
        #[arg(long, env = "SIGNFLOW_P12_PASSWORD")]
        password: String,
        #[arg(long, value_name = "PNG")]
        image: PathBuf,
        #[arg(long, value_name = "LABEL")]
        role: String,
        #[arg(long, default_value = "right")]
        position: Position,
        #[arg(long)]
        all_pages: bool,
        #[arg(long)]
        opaque: bool,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long, default_value_t = 1)]
        doc_id: u64,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Lists the active certificate authorities
    TrustStore,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_trust_store(config: &Config, config_path: Option<&Path>) -> Result<TrustStore> {
    let base_dir = config_path
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new("."));
    TrustStore::from_config(config, base_dir)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };

    match cli.command {
        Command::ValidatePdf { files } => {
            let store = load_trust_store(&config, cli.config.as_deref())?;
            let validator = Validator::new(TrustStoreHandle::new(store));
            for file in files {
                let pdf = std::fs::read(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                log::info!("validating {}", file.display());
                print_json(&validator.validate_pdf(&pdf))?;
            }
        }
        Command::ValidateP12 { file, password } => {
            let store = load_trust_store(&config, cli.config.as_deref())?;
            let validator = Validator::new(TrustStoreHandle::new(store));
            let p12 =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            print_json(&validator.validate_p12(&p12, &password)?)?;
        }
        Command::Sign {
            pdf,
            p12,
            password,
            image,
            role,
            position,
            all_pages,
            opaque,
            email,
            city,
            doc_id,
            output,
        } => {
            let pdf_bytes =
                std::fs::read(&pdf).with_context(|| format!("reading {}", pdf.display()))?;
            let p12 = std::fs::read(&p12).with_context(|| format!("reading {}", p12.display()))?;
            let image =
                std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;

            let credential = Credential::from_pkcs12(&p12, &password)?;
            let image = ImageComposer::from_config(&config.signing).compose(&image, &role, opaque)?;
            let request = SigningRequest {
                document_id: doc_id,
                image: &image,
                position,
                sign_all_pages: all_pages,
                role_label: &role,
                email: email.as_deref(),
                city: city.as_deref(),
            };
            let signed = PdfSigner::new(&config.signing).sign(&pdf_bytes, &credential, &request)?;
            std::fs::write(&output, signed)
                .with_context(|| format!("writing {}", output.display()))?;
            log::info!("signed document written to {}", output.display());
        }
        Command::TrustStore => {
            let store = load_trust_store(&config, cli.config.as_deref())?;
            let active: Vec<_> = store.list_active().map(|ca| ca.summary()).collect();
            print_json(&active)?;
        }
    }

    Ok(())
}
