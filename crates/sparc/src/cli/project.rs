//! Project command - create, list, show and delete projects

use clap::Subcommand;
use serde_json::json;
use sparc::SparcService;

use crate::cli::error::CliResult;
use crate::cli::output::print_json;

#[derive(Subcommand, Debug, Clone)]
pub enum ProjectAction {
    /// Create a project (or update its title and description)
    Create {
        /// Lowercase slug, e.g. `tonsil-2024`
        slug: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List projects, oldest first
    List,
    /// Show a project and its directory layout
    Show { slug: String },
    /// Delete a project, its records and its directory tree
    Delete { slug: String },
}

pub async fn run(service: &SparcService, action: ProjectAction) -> CliResult {
    match action {
        ProjectAction::Create {
            slug,
            title,
            description,
        } => {
            let project = service
                .create_project(&slug, title.as_deref(), description.as_deref())
                .await?;
            print_json(&project)
        }
        ProjectAction::List => print_json(&service.list_projects().await?),
        ProjectAction::Show { slug } => print_json(&service.get_project(&slug).await?),
        ProjectAction::Delete { slug } => {
            service.delete_project(&slug).await?;
            print_json(&json!({ "deleted": slug }))
        }
    }
}
