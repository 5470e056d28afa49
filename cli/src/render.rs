// cli/src/render.rs — Text and JSON output for bootsyncctl
// Text goes to stdout with a [section] tag per line; --json prints one
// pretty-printed document instead.

use serde_json::json;

use bootsync::bootmgr::BootManager;
use bootsync::kernel::{CommitReport, InstallReport, KernelManager, RemovalReport};

use crate::CliError;

fn boot_number(n: u16) -> String {
    format!("Boot{:04X}", n)
}

fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_commit(tag: &str, commit: &CommitReport) {
    match &commit.fallback_failure {
        None => println!("[{}] wrote {}", tag, commit.fallback.display()),
        Some(f) => println!("[{}] fallback config not written: {}", tag, f),
    }
    if let Some(fw) = &commit.firmware {
        for n in &fw.created {
            println!("[{}] created {}", tag, boot_number(*n));
        }
        for n in &fw.deleted {
            println!("[{}] deleted {}", tag, boot_number(*n));
        }
        let order: Vec<String> = fw.entries.iter().map(|n| boot_number(*n)).collect();
        println!("[{}] boot entries {}", tag, order.join(","));
    }
}

pub fn update(
    as_json: bool,
    install: &InstallReport,
    commit: &CommitReport,
    removal: &RemovalReport,
    cleanup: &CommitReport,
) -> Result<(), CliError> {
    if as_json {
        return print_json(&json!({
            "install": install,
            "commit": commit,
            "removal": removal,
            "cleanup": cleanup,
        }));
    }

    for k in &install.installed {
        println!("[install] installed {}", k);
    }
    for k in &install.unchanged {
        println!("[install] up to date {}", k);
    }
    for f in &install.failures {
        println!("[install] failed {}", f);
    }
    print_commit("commit", commit);
    for k in &removal.removed {
        println!("[remove] removed {}", k);
    }
    for f in &removal.failures {
        println!("[remove] failed {}", f);
    }
    print_commit("cleanup", cleanup);
    Ok(())
}

pub fn kernels(as_json: bool, km: &KernelManager) -> Result<(), CliError> {
    let settings = km.settings();
    if as_json {
        let target: Vec<_> = km
            .target_kernels()
            .iter()
            .map(|k| json!({ "file": k.file_name(), "version": k.version(), "obsolete": km.is_obsolete(k) }))
            .collect();
        return print_json(&json!({
            "source_dir": settings.source_dir,
            "target_dir": settings.target_dir,
            "source": km.source_kernels(),
            "target": target,
        }));
    }

    println!("[kernels] staged in {}", settings.source_dir.display());
    for k in km.source_kernels() {
        println!("  {}", k.file_name());
    }
    println!("[kernels] installed in {}", settings.target_dir.display());
    for k in km.target_kernels() {
        if km.is_obsolete(k) {
            println!("  {} (obsolete)", k.file_name());
        } else {
            println!("  {}", k.file_name());
        }
    }
    Ok(())
}

pub fn entries(as_json: bool, bm: &BootManager) -> Result<(), CliError> {
    let order: Vec<String> = bm.boot_order().iter().map(|n| boot_number(*n)).collect();
    if as_json {
        let entries: Vec<_> = bm
            .entries()
            .map(|e| {
                json!({
                    "number": boot_number(e.number),
                    "description": e.option.description,
                    "active": e.option.is_active(),
                    "path": e.option.file_path.to_string(),
                    "options": e.option.optional_data_text(),
                })
            })
            .collect();
        return print_json(&json!({ "boot_order": order, "entries": entries }));
    }

    println!("[entries] BootOrder: {}", order.join(","));
    for e in bm.entries() {
        let active = if e.option.is_active() { "*" } else { " " };
        print!("{}{} {}\t{}", boot_number(e.number), active, e.option.description, e.option.file_path);
        match e.option.optional_data_text() {
            Some(opts) if !opts.is_empty() => println!(" {}", opts),
            _ => println!(),
        }
    }
    Ok(())
}
