use anyhow::{anyhow, Context, Result};
use binance_confluence_bot::backtester::{parse_date, BacktestConfig, BacktestResults, Backtester};
use binance_confluence_bot::binance::BinanceClient;
use binance_confluence_bot::bot_config::{self, BotConfig, TEMPLATE_NAMES};
use binance_confluence_bot::comparison::BacktestComparison;
use binance_confluence_bot::config::Config;
use binance_confluence_bot::data_loader::DataLoader;
use binance_confluence_bot::metrics::{export_trades_csv, PerformanceMetrics};
use binance_confluence_bot::walkforward;
use chrono::Duration;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;

fn cli() -> Command {
    Command::new("Binance Confluence Bot Backtester")
        .version("1.0")
        .about("Backtest the confluence strategy against historical data")
        .arg(
            Arg::new("start-date")
                .long("start-date")
                .help("Start date for backtest (YYYY-MM-DD)")
                .default_value("2024-01-01"),
        )
        .arg(
            Arg::new("end-date")
                .long("end-date")
                .help("End date for backtest (YYYY-MM-DD)")
                .default_value("2024-01-31"),
        )
        .arg(
            Arg::new("initial-balance")
                .long("initial-balance")
                .help("Initial balance for backtest")
                .default_value("1000"),
        )
        .arg(
            Arg::new("symbols")
                .long("symbols")
                .help("Comma separated symbols (defaults to the strategy's list)")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .help("Data interval (1m, 5m, 15m, 1h)")
                .default_value("5m"),
        )
        .arg(
            Arg::new("commission")
                .long("commission")
                .help("Commission rate (e.g., 0.001 for 0.1%)")
                .default_value("0.001"),
        )
        .arg(
            Arg::new("slippage")
                .long("slippage")
                .help("Slippage rate (e.g., 0.0005 for 0.05%)")
                .default_value("0.0005"),
        )
        .arg(
            Arg::new("template")
                .long("template")
                .help("Strategy template to mirror")
                .value_parser(TEMPLATE_NAMES)
                .default_value("balanced"),
        )
        .arg(
            Arg::new("bot-config")
                .long("bot-config")
                .help("Bot configuration TOML file (overrides --template)")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .help("Directory for cached candle CSVs")
                .default_value("data"),
        )
        .arg(
            Arg::new("export")
                .long("export")
                .help("Export trades to CSV file")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("save-json")
                .long("save-json")
                .help("Save full results as JSON for later comparison")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("compare")
                .long("compare")
                .help("Compare saved JSON results instead of running a backtest")
                .value_name("FILE")
                .num_args(1..),
        )
        .arg(
            Arg::new("compare-export")
                .long("compare-export")
                .help("Write the comparison table to CSV")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("walk-forward")
                .long("walk-forward")
                .help("Backtest consecutive windows ending at --end-date instead of one range")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("period-days")
                .long("period-days")
                .help("Walk-forward window length in days")
                .value_parser(clap::value_parser!(i64).range(1..))
                .default_value("7"),
        )
        .arg(
            Arg::new("periods")
                .long("periods")
                .help("Number of walk-forward windows")
                .value_parser(clap::value_parser!(usize))
                .default_value("4"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing --{}", name))
}

fn decimal_arg(matches: &ArgMatches, name: &str) -> Result<Decimal> {
    let raw = arg(matches, name)?;
    Decimal::from_str(raw).with_context(|| format!("--{} must be a number, got {:?}", name, raw))
}

fn load_bot_config(matches: &ArgMatches) -> Result<BotConfig> {
    if let Some(path) = matches.get_one::<String>("bot-config") {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        return bot_config::parse_and_validate(&text).map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            anyhow!("Invalid bot config {}: {}", path, messages.join("; "))
        });
    }
    let name = arg(matches, "template")?;
    bot_config::template(name).ok_or_else(|| anyhow!("Unknown template {}", name))
}

fn compare(files: Vec<PathBuf>, export: Option<&String>) -> Result<()> {
    let comparison = BacktestComparison::load_files(&files)?;
    println!("{}", comparison.table());
    if let Some(summary) = comparison.summary() {
        println!(
            "{} runs, return %: mean {:.2}, min {:.2}, max {:.2}",
            summary.count, summary.total_return.mean, summary.total_return.min, summary.total_return.max
        );
    }
    for metric in ["total_return_percent", "sharpe_ratio", "max_drawdown_percent"] {
        let best = comparison.best_by(metric)?;
        println!("Best by {:<22} {}", metric, best.name);
    }
    if let Some(path) = export {
        comparison.export_csv(path)?;
        info!("Comparison exported to {}", path);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let matches = cli().get_matches();

    let level = if matches.get_flag("verbose") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    if let Some(files) = matches.get_many::<String>("compare") {
        return compare(files.map(PathBuf::from).collect(), matches.get_one::<String>("compare-export"));
    }

    let bot = load_bot_config(&matches)?;
    let symbols: Vec<String> = match matches.get_many::<String>("symbols") {
        Some(values) => values.map(|s| s.trim().to_uppercase()).collect(),
        None => bot.symbols.clone(),
    };
    if symbols.is_empty() {
        return Err(anyhow!("No symbols to backtest"));
    }

    let mut backtest_config = BacktestConfig {
        start_date: arg(&matches, "start-date")?.clone(),
        end_date: arg(&matches, "end-date")?.clone(),
        initial_balance: decimal_arg(&matches, "initial-balance")?,
        commission_rate: decimal_arg(&matches, "commission")?,
        slippage: decimal_arg(&matches, "slippage")?,
        data_interval: arg(&matches, "interval")?.clone(),
        ..BacktestConfig::from_bot_config(&bot)
    };
    let walk_forward = matches.get_flag("walk-forward");
    let windows = if walk_forward {
        let period_days = *matches.get_one::<i64>("period-days").ok_or_else(|| anyhow!("missing --period-days"))?;
        let periods = *matches.get_one::<usize>("periods").ok_or_else(|| anyhow!("missing --periods"))?;
        if periods == 0 {
            return Err(anyhow!("--periods must be at least 1"));
        }
        let end = parse_date(&backtest_config.end_date)?;
        let windows = walkforward::windows(end, period_days, periods);
        // Download the whole span once, windows slice it
        let start = end - Duration::days(period_days * periods as i64);
        backtest_config.start_date = start.format("%Y-%m-%d").to_string();
        windows
    } else {
        Vec::new()
    };
    backtest_config.parse_dates()?;

    info!(
        "Backtesting {} ({}) on {} from {} to {}",
        bot.strategy_name,
        bot.bot_type.as_str(),
        symbols.join(","),
        backtest_config.start_date,
        backtest_config.end_date
    );

    // Historical klines are public, no keys needed
    let config = Config::load()?;
    let client = BinanceClient::new(String::new(), String::new(), config.binance.base_url.clone());
    let loader = DataLoader::new(client, arg(&matches, "data-dir")?);
    let data = loader
        .load_many(
            &symbols,
            &backtest_config.data_interval,
            &backtest_config.start_date,
            &backtest_config.end_date,
        )
        .await?;

    if walk_forward {
        let report = walkforward::run(&backtest_config, &data, &windows)?;
        println!("{}", report.text());
        if let Some(path) = matches.get_one::<String>("save-json") {
            std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
            info!("Walk-forward results saved to {}", path);
        }
        return Ok(());
    }

    let mut backtester = Backtester::new(backtest_config);
    let results: BacktestResults = backtester.run(&data)?;

    let metrics = PerformanceMetrics::calculate(&results);
    println!("{}", metrics.report());

    if let Some(path) = matches.get_one::<String>("export") {
        export_trades_csv(&results.trades, path)?;
        info!("Trades exported to {}", path);
    }
    if let Some(path) = matches.get_one::<String>("save-json") {
        std::fs::write(path, serde_json::to_string_pretty(&results)?)?;
        info!("Results saved to {}", path);
    }

    Ok(())
}
