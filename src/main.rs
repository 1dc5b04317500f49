use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use house_hunt::config::ScoutConfig;
use house_hunt::enrichment::{DistanceCache, DistanceEnricher, GoogleDistanceMatrix};
use house_hunt::models::ListingCollection;
use house_hunt::output::{load_pages, save_pages, JsonExporter, ListingExporter};
use house_hunt::parser::ListingParser;
use house_hunt::scrapers::search_with_chrome;
use house_hunt::sites::{self, SiteCapability};

#[derive(Parser)]
#[command(name = "house-hunt", version, about = "Property search, extraction and travel-time enrichment")]
struct Cli {
    /// Configuration file (TOML). Missing means defaults.
    #[arg(long, global = true, default_value = "house-hunt.toml", env = "HOUSE_HUNT_CONFIG")]
    config: PathBuf,

    /// Built-in site name or capability TOML file; overrides the config
    #[arg(long, global = true)]
    site: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the built-in sites
    ListSites,
    /// Drive the search form and save the result pages
    Search {
        #[arg(long)]
        max_pages: Option<usize>,
    },
    /// Parse saved result pages into listings
    Parse {
        /// Directory of saved pages; defaults to <output>/<site>/search
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        enrich: bool,
        /// JSON file to write; defaults to <output>/<site>/listings.json
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Search, parse, optionally enrich, and write JSON
    Run {
        #[arg(long)]
        enrich: bool,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ScoutConfig::load(Some(&cli.config))?;
    if let Some(site) = cli.site {
        config.site = site;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, winding down");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::ListSites => {
            for name in sites::available() {
                println!("{name}");
            }
        }
        Command::Search { max_pages } => {
            if let Some(max_pages) = max_pages {
                config.engine.max_pages = max_pages;
            }
            let capability = Arc::new(resolve_site(&config.site)?);
            search(&config, capability, &cancel).await?;
        }
        Command::Parse { input, enrich, output } => {
            let capability = resolve_site(&config.site)?;
            let input = input.unwrap_or_else(|| config.pages_dir(capability.name()));
            let pages = load_pages(&input)
                .await
                .with_context(|| format!("Failed to read pages from {}", input.display()))?;
            info!("📄 Loaded {} pages from {}", pages.len(), input.display());

            let listings = ListingParser::new(&capability).parse_pages(&pages);
            finish(&config, &capability, listings, enrich, output, &cancel).await?;
        }
        Command::Run { enrich, output } => {
            let capability = Arc::new(resolve_site(&config.site)?);
            let pages = search(&config, capability.clone(), &cancel).await?;
            let listings = ListingParser::new(&capability).parse_pages(&pages);
            finish(&config, &capability, listings, enrich, output, &cancel).await?;
        }
    }

    Ok(())
}

fn resolve_site(site: &str) -> Result<SiteCapability> {
    let path = Path::new(site);
    let capability = if site.ends_with(".toml") || path.is_file() {
        sites::load_file(path).with_context(|| format!("Failed to load capability file {site}"))?
    } else {
        sites::by_name(site)?
    };
    Ok(capability)
}

async fn search(
    config: &ScoutConfig,
    capability: Arc<SiteCapability>,
    cancel: &CancellationToken,
) -> Result<Vec<house_hunt::RawPage>> {
    info!("🏠 Searching {} for {} location(s)", capability.name(), config.criteria.locations.len());

    let outcome = search_with_chrome(
        capability.clone(),
        config.criteria.clone(),
        config.browser.clone(),
        config.retry.session.clone(),
        config.engine.clone(),
        cancel.clone(),
    )
    .await;

    if outcome.pages.is_empty() {
        match outcome.error {
            Some(e) => return Err(e.into()),
            None => bail!("search finished without any result pages"),
        }
    }
    if let Some(e) = &outcome.error {
        error!(error = %e, pages = outcome.pages.len(), "Search stopped early, keeping partial results");
    }

    save_pages(&outcome.pages, &config.pages_dir(capability.name())).await?;
    Ok(outcome.pages)
}

async fn finish(
    config: &ScoutConfig,
    capability: &SiteCapability,
    mut listings: ListingCollection,
    enrich: bool,
    output: Option<PathBuf>,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("✅ Parsed {} listings", listings.len());

    if enrich {
        let Some(api_key) = config.enrichment.api_key.clone() else {
            bail!("enrichment needs a Google Maps API key in GOOGLE_MAPS_API_KEY");
        };
        let mut api = GoogleDistanceMatrix::new(api_key, Duration::from_secs(config.enrichment.request_timeout_secs))?;
        if let Some(base_url) = &config.enrichment.base_url {
            api = api.with_base_url(base_url.clone());
        }

        let mut cache = DistanceCache::open(&config.enrichment.cache_path);
        let enricher = DistanceEnricher::new(Arc::new(api), config.enrichment_settings());
        let report = enricher
            .enrich(listings.as_mut_slice(), &config.locations, &mut cache, cancel)
            .await;
        info!(
            "🚆 Travel times: {} cached, {} resolved, {} unreachable, {} unresolved",
            report.cache_hits, report.resolved, report.unreachable, report.unresolved
        );

        if config.enrichment.filter {
            let before = listings.len();
            listings = listings.filter_by_travel_time(
                &config.locations,
                config.enrichment.max_transit_mins,
                config.enrichment.max_driving_mins,
            );
            info!("Filtered {} listings over the travel limits", before - listings.len());
        }
    }

    let path = output.unwrap_or_else(|| config.output.dir.join(capability.name()).join("listings.json"));
    JsonExporter.export(&listings.into_vec(), &path).await?;
    Ok(())
}
