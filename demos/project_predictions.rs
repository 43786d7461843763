//! Load a Tasking Manager project and its fAIr predictions.
//!
//! Run with: RUST_LOG=info cargo run --example project_predictions -- <project_id>
//!
//! Honours FAIR_ENV, FAIR_API_URL, TASKING_MANAGER_API_URL and FAIR_ACCESS_TOKEN.

use fair_task_insights::project::task_status_breakdown;
use fair_task_insights::{
    ClientConfig, FairClient, FileTokenStore, PredictionState, Session, TaskingManagerClient,
};

#[tokio::main]
async fn main() -> fair_task_insights::Result<()> {
    env_logger::init();

    let config = ClientConfig::from_env();
    let tasking_manager = TaskingManagerClient::new(&config)?;

    let project_id = match std::env::args().nth(1).and_then(|a| a.parse::<u64>().ok()) {
        Some(id) => id,
        None => {
            let projects = tasking_manager.list_projects().await?;
            println!("Usage: project_predictions <project_id>\n");
            println!("{} projects available, first ten:", projects.len());
            for project in projects.iter().take(10) {
                println!("   #{:<6} {}", project.project_id, project.display_name());
            }
            return Ok(());
        }
    };

    let project = tasking_manager.get_project(project_id).await?;
    println!("Project #{}: {}", project.project_id, project.name());
    println!("   imagery: {}", project.imagery().unwrap_or("Not specified"));
    println!("   license: {}", project.license().unwrap_or_else(|| "Not specified".into()));

    let fair = FairClient::new(config.clone())?;
    let store = FileTokenStore::new(std::env::temp_dir().join("fair-task-insights").join("storage.json"));
    let mut session = Session::new(fair, store);

    if let Ok(token) = std::env::var("FAIR_ACCESS_TOKEN") {
        match session.authenticate(&token).await {
            Ok(user) => println!("   signed in as {}", user.username.as_deref().unwrap_or("unknown")),
            Err(e) => println!("   sign-in failed: {}", e),
        }
    } else if let Some(user) = session.restore().await? {
        println!("   signed in as {}", user.username.as_deref().unwrap_or("unknown"));
    }

    session.select_project(project);

    println!("\nTask status:");
    for (status, count) in task_status_breakdown(session.tasks()) {
        println!("   {:<22} {}", status.label(), count);
    }

    println!("\nPredictions:");
    let state = session.load_predictions().await?.clone();
    match &state {
        PredictionState::Ready { source, .. } => {
            println!("   source: {}", source.name());
            if let Some(summary) = session.summary() {
                println!("   {}", summary.headline());
                println!(
                    "   peak {} | average per active task {} | coverage {:.1}%",
                    summary.peak,
                    summary.average_per_active_task,
                    summary.coverage_percent()
                );
            }
        }
        PredictionState::Unavailable => println!("   no predictions available for this project yet"),
        PredictionState::Failed(message) => println!("   failed: {}", message),
        PredictionState::Idle | PredictionState::Loading => {}
    }

    Ok(())
}
