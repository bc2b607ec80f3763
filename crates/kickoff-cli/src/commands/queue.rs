use crate::commands::common::{
    format_mutation_lines, mutation_to_item, normalize_mutation_id, open_orchestrator,
    print_json, MutationItem, Options,
};
use crate::error::CliError;

pub async fn run_dead_letters(options: &Options) -> Result<(), CliError> {
    let orchestrator = open_orchestrator(options).await?;
    let dead = orchestrator.dead_letters().await?;

    if options.json {
        let json_items = dead.iter().map(mutation_to_item).collect::<Vec<MutationItem>>();
        return print_json(&json_items);
    }

    if dead.is_empty() {
        println!("No dead-lettered mutations.");
        return Ok(());
    }

    for line in format_mutation_lines(&dead) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_retry(id: &str, options: &Options) -> Result<(), CliError> {
    let id = normalize_mutation_id(id)?;
    let orchestrator = open_orchestrator(options).await?;
    orchestrator.retry_dead_letter(&id).await?;
    let report = orchestrator.process_queue().await?;

    if options.json {
        print_json(&report)?;
    } else {
        println!("Requeued {id}; {} delivered", report.delivered);
    }
    Ok(())
}

pub async fn run_discard(id: &str, options: &Options) -> Result<(), CliError> {
    let id = normalize_mutation_id(id)?;
    let orchestrator = open_orchestrator(options).await?;
    orchestrator.discard_mutation(&id).await?;
    println!("Discarded {id}");
    Ok(())
}
