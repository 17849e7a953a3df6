use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use formulary::config::Config;
use formulary::descriptor;
use formulary::pipeline::{InstallOptions, InstallReport, Pipeline, StepOutcome};
use formulary::registry::JsonRegistry;
use formulary::service::Launchctl;

#[derive(Parser)]
#[command(name = "formulary")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "声明式安装脚本包并注册 launchd 定时任务", long_about = None)]
struct Cli {
    /// 输出更详细的日志（可重复）
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// 配置文件路径（默认 ~/.config/formulary/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 覆盖安装前缀
    #[arg(long, global = true)]
    prefix: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 按描述文件安装
    Install {
        descriptor: PathBuf,

        /// 跳过安装后的冒烟测试
        #[arg(long)]
        no_verify: bool,

        /// 安装后写入定时任务描述文件（不会启用）
        #[arg(long)]
        register_schedule: bool,

        /// 以 JSON 输出安装报告
        #[arg(long)]
        json: bool,
    },

    /// 删除已安装的文件、定时任务描述文件与记录
    Uninstall { name: String },

    /// 写入（或覆盖）定时任务描述文件
    RegisterSchedule { name: String },

    /// 启用已注册的定时任务
    Activate { name: String },

    /// 停用定时任务
    Deactivate { name: String },

    /// 运行冒烟测试
    Verify { name: String },

    /// 列出已安装的包
    List,

    /// 显示已安装包的记录
    Info {
        name: String,

        /// 只输出安装时使用的描述文件（TOML）
        #[arg(long)]
        descriptor: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            e.downcast_ref::<formulary::Error>()
                .map(formulary::Error::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(prefix) = cli.prefix {
        config.prefix = prefix;
    }
    config.ensure_dirs()?;
    log::debug!("使用配置: {:?}", config);

    let mut registry = JsonRegistry::open(&config.registry_path())?;
    let controller = Launchctl;
    let mut pipeline = Pipeline::new(&config, &mut registry, &controller);

    match cli.command {
        Commands::Install {
            descriptor,
            no_verify,
            register_schedule,
            json,
        } => {
            let options = InstallOptions {
                verify: !no_verify,
                register_schedule,
            };
            let report = pipeline
                .install(&descriptor, options)
                .await
                .with_context(|| format!("安装 {} 失败", descriptor.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_install_report(&report);
            }
        }
        Commands::Uninstall { name } => {
            let package = pipeline.uninstall(&name)?;
            println!("已卸载 {}（{} 个文件）", package.name, package.files.len());
        }
        Commands::RegisterSchedule { name } => {
            let registration = pipeline.register_schedule(&name)?;
            println!(
                "已写入 {}{}",
                registration.service_file.display(),
                if registration.activated {
                    "，已启用"
                } else {
                    "（未启用，使用 formulary activate 手动启用）"
                }
            );
        }
        Commands::Activate { name } => {
            pipeline.activate(&name)?;
            println!("已启用 {} 的定时任务", name);
        }
        Commands::Deactivate { name } => {
            pipeline.deactivate(&name)?;
            println!("已停用 {} 的定时任务", name);
        }
        Commands::Verify { name } => {
            let report = pipeline.verify(&name)?;
            print!("{}", report.stdout);
            eprint!("{}", report.stderr);
            let report = report.into_result()?;
            println!("验证通过: {}", report.command.display());
        }
        Commands::List => {
            let packages = pipeline.list()?;
            if packages.is_empty() {
                println!("没有已安装的包");
            }
            for package in packages {
                println!(
                    "{:<24} {:<8} {}",
                    package.name,
                    package.short_revision(),
                    package
                        .installed_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Info {
            name,
            descriptor: descriptor_only,
        } => {
            let package = pipeline.info(&name)?;
            if descriptor_only {
                print!("{}", descriptor::to_toml(&package.descriptor)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&package)?);
            }
        }
    }

    Ok(())
}

fn print_install_report(report: &InstallReport) {
    println!("已安装 {}", report.name);
    if let Some(revision) = &report.revision {
        println!("  版本: {}", revision);
    }
    for file in &report.files {
        println!("  {}", file.display());
    }
    if !report.missing_dependencies.is_empty() {
        println!("  ⚠ 缺少依赖: {}", report.missing_dependencies.join(", "));
    }

    match &report.registration {
        StepOutcome::Skipped => {}
        StepOutcome::Completed(r) => println!(
            "  定时任务: {}{}",
            r.service_file.display(),
            if r.activated { "（已启用）" } else { "（未启用）" }
        ),
        StepOutcome::Failed { message } => println!("  ⚠ 定时任务注册失败: {}", message),
    }

    match &report.verification {
        StepOutcome::Skipped => {}
        StepOutcome::Completed(v) if v.passed() => println!("  验证: 通过"),
        StepOutcome::Completed(v) => {
            println!(
                "  ⚠ 验证未通过: 退出码 {:?}，期望 {}",
                v.exit_code, v.expected_exit_code
            );
            let output = v.combined_output();
            if !output.trim().is_empty() {
                println!("{}", output.trim_end());
            }
        }
        StepOutcome::Failed { message } => println!("  ⚠ 验证失败: {}", message),
    }
}
