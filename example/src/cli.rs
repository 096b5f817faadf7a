// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use bpaf::{batteries::verbose_by_slice, construct, long, positional, OptionParser, Parser};
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone)]
pub struct Options {
    pub verbosity_level: LevelFilter,
    pub config_path: Option<PathBuf>,
    pub worker_threads: Option<usize>,
    pub entities: usize,
    pub files: Vec<PathBuf>,
}

pub fn options() -> OptionParser<Options> {
    let verbosity_level = verbose_by_slice(
        3,
        [
            LevelFilter::OFF,
            LevelFilter::ERROR,
            LevelFilter::WARN,
            LevelFilter::INFO,
            LevelFilter::DEBUG,
            LevelFilter::TRACE,
        ],
    );

    let config_path = long("config")
        .help("Reads the engine configuration from a JSON file")
        .argument::<PathBuf>("FILE")
        .complete_shell(bpaf::ShellComp::File { mask: Some("*.json") })
        .optional();

    let worker_threads = long("workers")
        .short('j')
        .help("Overrides the amount of thread pool workers")
        .argument::<usize>("N")
        .optional();

    let entities = long("entities")
        .short('n')
        .help("Amount of entities to spawn and sort")
        .argument::<usize>("N")
        .fallback(1000)
        .display_fallback();

    let files = positional::<PathBuf>("FILE")
        .help("Files to load on the IO thread")
        .complete_shell(bpaf::ShellComp::File { mask: None })
        .many();

    construct!(Options {
        verbosity_level,
        config_path,
        worker_threads,
        entities,
        files,
    })
    .to_options()
    .descr("Runs the engine's thread pool, IO thread and ECS over some example workloads")
}
