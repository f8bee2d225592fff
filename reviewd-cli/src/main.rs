use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use reviewd_core::{InterviewAnswer, InterviewQuestion, InterviewStep, Provider};
use reviewd_server::config::Config;
use reviewd_server::db::{Store, UserSettings};
use reviewd_server::forge::github::GitHubApp;
use reviewd_server::forge::{GitHubForge, GitLabForge};
use reviewd_server::queue::{Queue, QUEUE_REPO_ANALYSIS};
use reviewd_server::routes::connect_repository;
use reviewd_server::skills::SkillsCatalog;
use reviewd_server::tokens::TokenStore;
use reviewd_server::{interview, AppState};

/// Operator CLI for the review pipeline. Works directly against the
/// worker's state database, standing in for the dashboard.
#[derive(Parser, Debug)]
#[command(name = "reviewd")]
#[command(about = "Operator CLI for the reviewd code-review pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect a repository and enqueue its analysis
    Connect(ConnectArgs),
    /// Run the persona interview for a repository interactively
    Interview(InterviewArgs),
    /// List recent reviews for a user
    Reviews(ReviewsArgs),
    /// Re-enqueue the analysis job for a connected repository
    EnqueueAnalysis(EnqueueArgs),
    /// Store a user's model selection and agent API key
    Configure(ConfigureArgs),
}

#[derive(Parser, Debug)]
struct ConnectArgs {
    #[arg(long)]
    user: String,

    /// Repository in owner/name form
    #[arg(long)]
    name: String,

    #[arg(long, value_parser = ["github", "gitlab"])]
    provider: String,
}

#[derive(Parser, Debug)]
struct InterviewArgs {
    #[arg(long)]
    user: String,

    #[arg(long)]
    slug: String,
}

#[derive(Parser, Debug)]
struct ReviewsArgs {
    #[arg(long)]
    user: String,

    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Parser, Debug)]
struct EnqueueArgs {
    #[arg(long)]
    user: String,

    #[arg(long)]
    slug: String,
}

#[derive(Parser, Debug)]
struct ConfigureArgs {
    #[arg(long)]
    user: String,

    /// Model in provider/model form
    #[arg(long)]
    model: Option<String>,

    /// Agent API key
    #[arg(long)]
    api_key: Option<String>,

    /// Maximum comments per review (1-50)
    #[arg(long)]
    max_comments: Option<u32>,
}

fn build_state() -> Result<Arc<AppState>> {
    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);
    let db_path = config.state_dir.join("reviewd.db");
    let store = Store::open(&db_path)?;
    let queue = Queue::open(&db_path)?;
    let skills = SkillsCatalog::load(&config.skills_dir)?;

    let github_app = match (config.github_app_id, config.github_app_private_key.clone()) {
        (Some(app_id), Some(private_key)) => Some(GitHubApp {
            app_id,
            private_key,
        }),
        _ => None,
    };

    let tokens = TokenStore::new(store.clone(), config.clone());
    Ok(Arc::new(AppState {
        github: GitHubForge::new(github_app),
        gitlab: GitLabForge::new(config.gitlab_bot_token.clone(), config.gitlab_bot_user_id),
        config: config.clone(),
        store,
        queue,
        tokens,
        skills,
    }))
}

fn print_question(question: &InterviewQuestion, number: u32, total: u32) {
    println!("\nQuestion {}/{}", number, total);
    match question {
        InterviewQuestion::SingleSelect { question, options } => {
            println!("{}", question);
            for (i, option) in options.iter().enumerate() {
                println!("  {}. {}", i + 1, option);
            }
            println!("(pick one)");
        }
        InterviewQuestion::MultiSelect { question, options } => {
            println!("{}", question);
            for (i, option) in options.iter().enumerate() {
                println!("  {}. {}", i + 1, option);
            }
            println!("(pick any, comma-separated)");
        }
        InterviewQuestion::CodeOpinion {
            question,
            options,
            code_snippet,
            code_file,
        } => {
            println!("{}", question);
            println!("\n--- {} ---\n{}\n---", code_file, code_snippet);
            for (i, option) in options.iter().enumerate() {
                println!("  {}. {}", i + 1, option);
            }
        }
        InterviewQuestion::ConfirmCorrect {
            question,
            detections,
        } => {
            println!("{}", question);
            for detection in detections {
                println!("  - {}", detection);
            }
            println!("(confirm or correct)");
        }
        InterviewQuestion::ShortText {
            question,
            placeholder,
        } => {
            println!("{}", question);
            if let Some(placeholder) = placeholder {
                println!("(e.g. {})", placeholder);
            }
        }
    }
}

fn question_text(question: &InterviewQuestion) -> String {
    match question {
        InterviewQuestion::SingleSelect { question, .. }
        | InterviewQuestion::MultiSelect { question, .. }
        | InterviewQuestion::CodeOpinion { question, .. }
        | InterviewQuestion::ConfirmCorrect { question, .. }
        | InterviewQuestion::ShortText { question, .. } => question.clone(),
    }
}

async fn run_interview(state: &AppState, args: &InterviewArgs) -> Result<()> {
    let stdin = io::stdin();
    let mut answers: Vec<InterviewAnswer> = Vec::new();

    loop {
        let step = interview::step(state, &args.user, &args.slug, &answers).await?;
        match step {
            InterviewStep::Question {
                question,
                question_number,
                estimated_total,
            } => {
                print_question(&question, question_number, estimated_total);
                print!("> ");
                io::stdout().flush()?;
                let mut answer = String::new();
                stdin.lock().read_line(&mut answer)?;
                answers.push(InterviewAnswer {
                    question: question_text(&question),
                    answer: answer.trim().to_string(),
                });
            }
            InterviewStep::Complete { persona } => {
                println!("\nInterview complete. Persona:\n\n{}", persona);
                println!("\nRepository {} is now active.", args.slug);
                return Ok(());
            }
            InterviewStep::Error { message } => {
                return Err(anyhow!("interview failed: {}", message));
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::WARN).init();

    let cli = Cli::parse();
    let state = build_state()?;

    match cli.command {
        Commands::Connect(args) => {
            let provider =
                Provider::parse(&args.provider).ok_or_else(|| anyhow!("unknown provider"))?;
            let repo = connect_repository(&state, &args.user, &args.name, provider).await?;
            println!(
                "Connected {} as {} (status: {})",
                repo.name,
                repo.slug,
                repo.status.as_str()
            );
        }
        Commands::Interview(args) => {
            run_interview(&state, &args).await?;
        }
        Commands::Reviews(args) => {
            let reviews = state.store.list_reviews(&args.user, args.limit).await?;
            if reviews.is_empty() {
                println!("No reviews yet.");
            }
            for review in reviews {
                println!(
                    "{}  {}#{}  {}  {}",
                    review.created_at.format("%Y-%m-%d %H:%M"),
                    review.repo_slug,
                    review.pr_number,
                    review.summary,
                    review.pr_url
                );
            }
        }
        Commands::EnqueueAnalysis(args) => {
            let repo = state
                .store
                .get_repo(&args.user, &args.slug)
                .await?
                .ok_or_else(|| anyhow!("repository {} is not connected", args.slug))?;
            let payload = reviewd_core::RepoAnalysisPayload {
                user_id: repo.user_id,
                slug: repo.slug,
                repo_name: repo.name,
                provider: repo.provider,
            };
            let msg_id = state.queue.enqueue(QUEUE_REPO_ANALYSIS, &payload).await?;
            println!("Enqueued analysis job {}", msg_id);
        }
        Commands::Configure(args) => {
            let mut settings = state
                .store
                .get_user_settings(&args.user)
                .await?
                .unwrap_or_else(|| UserSettings {
                    user_id: args.user.clone(),
                    max_comments: 10,
                    ..Default::default()
                });
            if let Some(model) = args.model {
                if !model.contains('/') {
                    return Err(anyhow!("model must be in provider/model form"));
                }
                settings.llm_provider =
                    model.split('/').next().map(|p| p.to_string());
                settings.llm_model = Some(model);
            }
            if let Some(api_key) = args.api_key {
                settings.api_key = Some(api_key);
            }
            if let Some(max_comments) = args.max_comments {
                settings.max_comments = max_comments.clamp(1, 50);
            }
            state.store.upsert_user_settings(settings).await?;
            println!("Settings updated for {}", args.user);
        }
    }

    Ok(())
}
