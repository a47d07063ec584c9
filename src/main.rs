//! fxbot: session-driven forex trading bots.
//!
//! ```sh
//! fxbot --paper --test-mode sessions
//! fxbot --broker-config broker.json rsi --symbol GBPUSD --timeframe M15
//! fxbot --strategy-config news.json news --impact-threshold 0.5
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use fxbot::broker::{BrokerGateway, PaperBroker, TerminalBridgeClient};
use fxbot::config::{self, BrokerConfig, RunnerConfig};
use fxbot::strategy::{
    LondonBreakoutConfig, LondonBreakoutStrategy, NewsConfig, NewsImpactStrategy, RsiConfig,
    RsiStrategy, SessionOrderConfig, SessionOrderStrategy, StrategyRunner, VwapConfig,
    VwapReversionStrategy,
};
use fxbot::{logging, Strategy, Timeframe};

/// Paper quotes drift by up to this many pips per read
const PAPER_WALK_PIPS: f64 = 2.0;

#[derive(Parser, Debug)]
#[command(name = "fxbot")]
#[command(author, version, about = "Forex trading bots", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Broker connection JSON; FXBOT_* variables override it
    #[arg(long, global = true)]
    broker_config: Option<PathBuf>,

    /// Strategy parameters as JSON, layered over the command defaults
    #[arg(long, global = true)]
    strategy_config: Option<PathBuf>,

    /// Trade against the in-process paper broker
    #[arg(long, global = true)]
    paper: bool,

    /// Short bounded run (3 iterations, 5s apart unless overridden)
    #[arg(long, global = true)]
    test_mode: bool,

    /// Stop after this many ticks
    #[arg(long, global = true)]
    iterations: Option<u64>,

    /// Seconds between ticks
    #[arg(long, global = true)]
    interval: Option<u64>,

    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,
}

impl CommonArgs {
    fn runner_config(&self) -> RunnerConfig {
        let mut runner = if self.test_mode {
            RunnerConfig::test_mode(self.iterations)
        } else {
            RunnerConfig {
                iterations: self.iterations,
                ..RunnerConfig::default()
            }
        };
        if let Some(secs) = self.interval {
            runner.poll_interval_secs = secs;
        }
        runner
    }

    fn broker(&self, symbols: &[String]) -> Result<Arc<dyn BrokerGateway>> {
        if self.paper {
            tracing::info!("📝 Paper trading on {} symbols", symbols.len());
            let broker = PaperBroker::default()
                .with_price_walk(PAPER_WALK_PIPS)
                .with_reference_quotes(symbols);
            return Ok(Arc::new(broker));
        }
        let config = BrokerConfig::load(self.broker_config.as_deref())
            .context("failed to load broker config")?;
        tracing::info!("🔌 Terminal bridge at {}", config.bridge_url);
        let client = TerminalBridgeClient::new(config).context("failed to build terminal client")?;
        Ok(Arc::new(client))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Buy-stop straddle around each major session open
    Sessions {
        #[arg(long)]
        max_positions: Option<usize>,
        /// Lots per order
        #[arg(long)]
        volume: Option<f64>,
    },

    /// Two-sided session scalper with trailing stops
    Scalper {
        #[arg(long)]
        max_positions: Option<usize>,
        #[arg(long)]
        volume: Option<f64>,
    },

    /// RSI reversal on a single instrument
    Rsi {
        #[arg(long)]
        symbol: Option<String>,
        /// M1, M5, M15, M30, H1, H4 or D1
        #[arg(long)]
        timeframe: Option<Timeframe>,
        #[arg(long)]
        period: Option<usize>,
        #[arg(long)]
        overbought: Option<f64>,
        #[arg(long)]
        oversold: Option<f64>,
        #[arg(long)]
        risk_percent: Option<f64>,
    },

    /// Trade the reaction to scheduled economic releases
    News {
        /// JSON economic calendar
        #[arg(long)]
        calendar: Option<PathBuf>,
        #[arg(long)]
        impact_threshold: Option<f64>,
    },

    /// Breakout of the pre-London range
    London {
        /// Comma-separated instruments
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        #[arg(long)]
        range_hours: Option<i64>,
    },

    /// Intraday reversion to VWAP
    Vwap {
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Minimum distance from VWAP, in deviations
        #[arg(long)]
        deviation: Option<f64>,
    },
}

impl Commands {
    fn log_name(&self) -> &'static str {
        match self {
            Commands::Sessions { .. } => "session_straddle",
            Commands::Scalper { .. } => "session_scalper",
            Commands::Rsi { .. } => "rsi",
            Commands::News { .. } => "news",
            Commands::London { .. } => "london_breakout",
            Commands::Vwap { .. } => "vwap",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _guard = logging::init(cli.command.log_name(), &cli.common.log_dir)
        .context("failed to set up logging")?;
    tracing::info!("🚀 fxbot {} starting", cli.command.log_name());

    let common = &cli.common;
    let runner = common.runner_config();
    let strategy_config = common.strategy_config.as_deref();
    let scalper = matches!(cli.command, Commands::Scalper { .. });

    match cli.command {
        Commands::Sessions {
            max_positions,
            volume,
        }
        | Commands::Scalper {
            max_positions,
            volume,
        } => {
            let preset = if scalper {
                SessionOrderConfig::scalper()
            } else {
                SessionOrderConfig::straddle()
            };
            let mut config = config::load_json_over(strategy_config, preset)?;
            if let Some(max) = max_positions {
                config.orders.max_positions = max;
            }
            if let Some(volume) = volume {
                config.orders.volume = volume;
            }
            let calendar = config.build_calendar()?;
            let mut symbols: Vec<String> = calendar
                .sessions()
                .iter()
                .flat_map(|s| s.all_symbols().cloned())
                .collect();
            symbols.sort();
            symbols.dedup();

            let broker = common.broker(&symbols)?;
            let mut strategy = SessionOrderStrategy::new(config, broker.clone())?;
            run(broker, runner, &mut strategy).await
        }
        Commands::Rsi {
            symbol,
            timeframe,
            period,
            overbought,
            oversold,
            risk_percent,
        } => {
            let mut config: RsiConfig = config::load_json(strategy_config)?;
            if let Some(symbol) = symbol {
                config.symbol = symbol;
            }
            if let Some(timeframe) = timeframe {
                config.timeframe = timeframe;
            }
            if let Some(period) = period {
                config.rsi_period = period;
            }
            if let Some(level) = overbought {
                config.overbought = level;
            }
            if let Some(level) = oversold {
                config.oversold = level;
            }
            if let Some(risk) = risk_percent {
                config.risk_percent = risk;
            }
            anyhow::ensure!(
                config.oversold < config.overbought,
                "oversold ({}) must be below overbought ({})",
                config.oversold,
                config.overbought
            );

            let broker = common.broker(std::slice::from_ref(&config.symbol))?;
            let mut strategy = RsiStrategy::new(config, broker.clone());
            run(broker, runner, &mut strategy).await
        }
        Commands::News {
            calendar,
            impact_threshold,
        } => {
            let mut config: NewsConfig = config::load_json(strategy_config)?;
            if calendar.is_some() {
                config.calendar_path = calendar;
            }
            if let Some(threshold) = impact_threshold {
                config.impact_threshold = threshold;
            }
            let events = NewsImpactStrategy::load_calendar(&config, Utc::now())
                .context("failed to load economic calendar")?;
            tracing::info!("📅 {} calendar events", events.events().len());

            let broker = common.broker(&config.symbols)?;
            let mut strategy = NewsImpactStrategy::new(config, events, broker.clone());
            run(broker, runner, &mut strategy).await
        }
        Commands::London {
            symbols,
            range_hours,
        } => {
            let mut config: LondonBreakoutConfig = config::load_json(strategy_config)?;
            if !symbols.is_empty() {
                config.symbols = symbols;
            }
            if let Some(hours) = range_hours {
                config.range_hours = hours;
            }

            let broker = common.broker(&config.symbols)?;
            let mut strategy = LondonBreakoutStrategy::new(config, broker.clone());
            run(broker, runner, &mut strategy).await
        }
        Commands::Vwap { symbols, deviation } => {
            let mut config: VwapConfig = config::load_json(strategy_config)?;
            if !symbols.is_empty() {
                config.symbols = symbols;
            }
            if let Some(deviation) = deviation {
                config.vwap_deviation = deviation;
            }

            let broker = common.broker(&config.symbols)?;
            let mut strategy = VwapReversionStrategy::new(config, broker.clone())?;
            run(broker, runner, &mut strategy).await
        }
    }
}

async fn run<S: Strategy>(
    broker: Arc<dyn BrokerGateway>,
    runner: RunnerConfig,
    strategy: &mut S,
) -> Result<()> {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Strategy: {}", strategy.name());
    tracing::info!("  Poll interval: {}s", runner.poll_interval_secs);
    match runner.iterations {
        Some(n) => tracing::info!("  Iterations: {}", n),
        None => tracing::info!("  Iterations: until interrupted"),
    }

    let stats = StrategyRunner::new(broker, runner)
        .run(strategy)
        .await
        .with_context(|| format!("{} stopped with an error", strategy.name()))?;

    tracing::info!("✅ Done after {} ticks", stats.ticks);
    Ok(())
}
