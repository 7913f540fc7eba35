// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `snappager validate` command - Validate configuration file.

use std::path::Path;

use snappager_core::ConfigLoader;

fn optional(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Page Server Settings:");
            println!("  Handshake Socket:   {}", config.socket_path.display());
            println!("  Memory File:        {}", config.memory_file.display());
            println!(
                "  Trace File:         {}",
                optional(config.trace_file.as_deref())
            );
            println!(
                "  Working Set File:   {}",
                optional(config.working_set_file.as_deref())
            );
            println!("  Insertion Threads:  {}", config.threads);
            println!(
                "  Mode:               {}",
                if config.lazy { "lazy" } else { "eager" }
            );
            if let Some(store) = &config.chunk_store {
                println!();
                println!("Chunk Store:");
                println!("  Root:               {}", store.root.display());
                println!("  Chunk Size:         {} bytes", store.chunk_size);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
