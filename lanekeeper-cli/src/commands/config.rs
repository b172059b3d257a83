//! Configuration commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use lanekeeper_core::InstanceConfig;

use crate::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show current configuration (merged)
    Show,
    /// Show configuration file paths
    Path,
    /// List the lanes the current configuration carves out
    Lanes,
}

pub fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(),
        ConfigCommands::Path => show_paths(),
        ConfigCommands::Lanes => show_lanes(),
    }
}

fn show_config() -> Result<()> {
    let config = ConfigLoader::load()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{}", toml_str);
    Ok(())
}

fn show_paths() -> Result<()> {
    println!("User config:    {:?}", ConfigLoader::user_config_path());
    println!("Project config: {:?}", ConfigLoader::project_config_path());
    Ok(())
}

fn show_lanes() -> Result<()> {
    let config = ConfigLoader::load()?;
    println!("{}", lanes_table(&config));
    Ok(())
}

fn lanes_table(config: &InstanceConfig) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Lane").fg(Color::Cyan),
        Cell::new("GPU").fg(Color::Cyan),
        Cell::new("Memory").fg(Color::Cyan),
        Cell::new("Streams").fg(Color::Cyan),
    ]);

    for (id, lane) in config.lanes.iter().enumerate() {
        table.add_row(vec![
            Cell::new(id),
            Cell::new(lane.gpu),
            Cell::new(lane.memory),
            Cell::new(lane.streams),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanekeeper_core::LaneConfig;

    #[test]
    fn test_lanes_table_has_one_row_per_lane() {
        let config = InstanceConfig {
            lanes: vec![
                LaneConfig {
                    gpu: 0,
                    memory: 1024,
                    streams: 1,
                },
                LaneConfig {
                    gpu: 1,
                    memory: 2048,
                    streams: 2,
                },
            ],
            ..Default::default()
        };

        let table = lanes_table(&config);

        assert_eq!(table.row_iter().count(), 2);
        assert!(table.to_string().contains("2048"));
    }
}
