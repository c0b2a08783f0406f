use std::path::Path;

use ward_core::models::Ward;
use ward_core::util::normalize_text_option;

use crate::commands::common::{
    format_unit_lines, normalize_words, open_data, patients, settle, short_id,
    unit_to_list_item, units, CliData, UnitListItem,
};
use crate::error::CliError;

pub async fn add_unit(
    data: &CliData,
    name: &[String],
    floor: Option<String>,
) -> Result<Ward, CliError> {
    let name = normalize_words(name).ok_or(CliError::EmptyName)?;
    let mut unit = Ward::new(name);
    unit.floor = normalize_text_option(floor);
    data.add(unit.clone()).await?;
    Ok(unit)
}

pub async fn run_unit_add(
    name: &[String],
    floor: Option<String>,
    db_path: &Path,
) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let unit = add_unit(&data, name, floor).await?;
    settle(&data).await;
    println!("Created ward {} ({})", unit.name, short_id(&unit.id));
    Ok(())
}

pub async fn run_unit_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let data = open_data(db_path).await?;
    let all_patients = patients(&data);
    let items = units(&data)
        .iter()
        .map(|unit| unit_to_list_item(unit, &all_patients))
        .collect::<Vec<UnitListItem>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No wards yet. Create one with: ward unit add <name>");
        return Ok(());
    }

    for line in format_unit_lines(&items) {
        println!("{line}");
    }
    Ok(())
}
