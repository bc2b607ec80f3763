use std::sync::Arc;

use kickoff_core::{LocalRepository, RemoteConfig, TournamentRepository};

use crate::commands::common::{
    format_tournament_lines, open_local_cache, open_orchestrator, print_json,
    tournament_to_list_item, Options, TournamentListItem,
};
use crate::error::CliError;

pub async fn run_list(options: &Options) -> Result<(), CliError> {
    if RemoteConfig::from_env().is_configured() {
        let orchestrator = open_orchestrator(options).await?;
        print_tournaments(&orchestrator, options.json).await
    } else {
        let repository = LocalRepository::new(Arc::new(open_local_cache(options).await?));
        print_tournaments(&repository, options.json).await
    }
}

pub async fn print_tournaments<T: TournamentRepository>(
    repository: &T,
    as_json: bool,
) -> Result<(), CliError> {
    let tournaments = repository.list_for_current_user().await?;

    if as_json {
        let json_items = tournaments
            .iter()
            .map(tournament_to_list_item)
            .collect::<Vec<TournamentListItem>>();
        return print_json(&json_items);
    }

    if tournaments.is_empty() {
        println!("No tournaments.");
        return Ok(());
    }

    for line in format_tournament_lines(&tournaments) {
        println!("{line}");
    }
    Ok(())
}
