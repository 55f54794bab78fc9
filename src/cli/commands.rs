use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;

use super::{ClusterArgs, ConfigArgs, ProgressRenderer, RunArgs, SourceArgs, VerifyArgs};
use crate::config::{generate_sample_config, Config};
use crate::core::Manifest;
use crate::engine::{Evaluation, Evaluator};
use crate::synth::{preview_patches, JsonPatchFile};

fn load_manifest(args: &SourceArgs) -> Result<Arc<Manifest>> {
    let upload_id = match &args.upload_id {
        Some(id) => id.clone(),
        None => upload_id_from(&args.source),
    };
    let manifest = Manifest::scan(upload_id, &args.source)
        .with_context(|| format!("Failed to scan {}", args.source.display()))?;
    Ok(Arc::new(manifest))
}

fn upload_id_from(path: &Path) -> String {
    path.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "upload".to_string())
}

fn apply_overrides(mut config: Config, args: &RunArgs) -> Config {
    if let Some(secs) = args.timeout {
        config.runtime.agent_timeout_secs = secs.max(1);
    }
    if let Some(workers) = args.workers {
        config.runtime.max_concurrent_agents = workers;
    }
    config
}

/// Evaluate with a progress bar unless JSON output was asked for
async fn evaluate(config: Config, manifest: Arc<Manifest>, json: bool) -> Result<(Evaluator, Evaluation)> {
    if json {
        let evaluator = Evaluator::new(config);
        let evaluation = evaluator.evaluate(manifest).await?;
        return Ok((evaluator, evaluation));
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let evaluator = Evaluator::builder(config).events(tx).build();
    let plan = evaluator.plan(&manifest)?;
    println!("{}", plan.to_human_string());

    let renderer = ProgressRenderer::spawn(rx, plan.len() as u64)?;
    let evaluation = evaluator.evaluate(manifest).await;
    renderer.finish().await;
    Ok((evaluator, evaluation?))
}

pub async fn run_plan(config: Config, args: &SourceArgs, json: bool) -> Result<()> {
    let manifest = load_manifest(args)?;
    let plan = Evaluator::new(config).plan(&manifest)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!(
            "{} {} artifacts ({})",
            "ℹ".bright_cyan(),
            manifest.len(),
            humansize::format_size(manifest.total_bytes(), humansize::BINARY)
        );
        print!("{}", plan.to_human_string());
    }
    Ok(())
}

pub async fn run_evaluate(config: Config, args: &RunArgs, json: bool) -> Result<()> {
    let manifest = load_manifest(&args.source)?;
    let (_, evaluation) = evaluate(apply_overrides(config, args), manifest, json).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&evaluation.run)?);
        return Ok(());
    }

    print!("{}", evaluation.run.to_human_string());
    for finding in &evaluation.run.findings {
        println!(
            "  [{}] {} {} - {}",
            finding.severity().as_str().to_uppercase(),
            finding.criterion().as_str().bright_cyan(),
            finding.selector(),
            finding.details()
        );
    }
    Ok(())
}

pub async fn run_cluster(mut config: Config, args: &ClusterArgs, json: bool) -> Result<()> {
    if let Some(method) = args.method {
        config.clustering.method = method.into();
    }
    if let Some(threshold) = args.threshold {
        config.clustering.similarity_threshold = threshold;
    }
    config.validate()?;

    let manifest = load_manifest(&args.run.source)?;
    let (_, evaluation) = evaluate(apply_overrides(config, &args.run), manifest, json).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&evaluation.clustering)?);
    } else {
        print!("{}", evaluation.clustering.to_human_string());
    }
    Ok(())
}

pub async fn run_verify(config: Config, args: &VerifyArgs, json: bool) -> Result<()> {
    let patches = JsonPatchFile::new(&args.patches).load()?;
    let manifest = load_manifest(&args.run.source)?;
    let upload_id = manifest.upload_id().to_string();

    let (evaluator, evaluation) = evaluate(apply_overrides(config, &args.run), manifest.clone(), json).await?;
    if !json {
        let preview = preview_patches(&patches);
        println!(
            "\n{} {} patches touching {} files",
            "ℹ".bright_cyan(),
            preview.total_changes,
            preview.files_affected.len()
        );
    }

    let verification = evaluator
        .verify(manifest, &evaluation, &patches, args.scope.into())
        .await;
    if !args.keep_sandbox {
        evaluator.cleanup(&upload_id).await;
    }
    let verification = verification?;

    if json {
        println!("{}", serde_json::to_string_pretty(&verification)?);
    } else {
        for outcome in &verification.outcomes {
            match &outcome.error {
                None => println!("  {} {} ({})", "✓".bright_green(), outcome.target, outcome.patch_id),
                Some(e) => println!("  {} {}", "✗".red(), e.to_string().red()),
            }
        }
        let s = &verification.summary;
        println!(
            "\n  Patches: {} applied, {} failed ({} safe, {} risky)",
            s.applied, s.failed, s.safe, s.risky
        );
        print!("{}", verification.recheck.to_human_string());
        if args.keep_sandbox {
            println!("  Sandbox kept at {}", verification.sandbox_dir.display());
        }
    }

    if !verification.originals_intact {
        anyhow::bail!(
            "original artifacts changed during verification: {:?}",
            verification.originals_changed
        );
    }
    Ok(())
}

pub fn run_config(config: &Config, args: &ConfigArgs, path: &Path) -> Result<()> {
    if args.sample {
        print!("{}", generate_sample_config());
    } else if args.write {
        config.save_to(path)?;
        println!("{} Wrote {}", "✓".bright_green(), path.display());
    } else {
        print!("{}", toml::to_string_pretty(config).context("Failed to serialize config")?);
    }
    Ok(())
}
