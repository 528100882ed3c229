use counting_grids::artifacts::{doc_map, top_terms};
use counting_grids::config::{load_config, TrainingConfig};
use counting_grids::io::{load_counts, save_term_heatmap, write_json_file};
use counting_grids::output::JsonDirWriter;
use counting_grids::progress::{LogProgress, ProgressSink};
use counting_grids::{CountingGrid, FitResult, SlidingWindowPlan, SlidingWindowTrainer};
use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn usage() -> String {
    "Usage: cg_train <config.json>".to_string()
}

fn run() -> Result<(), String> {
    let config_path = env::args().nth(1).ok_or_else(usage)?;
    let config = load_config(Path::new(&config_path)).map_err(|e| e.to_string())?;

    let data = load_counts(&config.counts)?;
    let geometry = config.geometry().map_err(|e| e.to_string())?;
    let grid = CountingGrid::from_geometry(geometry).with_params(config.engine.clone());
    info!(
        "loaded {} documents x {} terms from {}",
        data.nrows(),
        data.ncols(),
        config.counts.display()
    );

    let out_dir = &config.output.dir;
    if !out_dir.as_os_str().is_empty() {
        fs::create_dir_all(out_dir)
            .map_err(|e| format!("Failed to create {}: {e}", out_dir.display()))?;
    }
    let mut writer = JsonDirWriter::new(if out_dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        out_dir.as_path()
    });
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let sinks: Vec<Arc<dyn ProgressSink>> = vec![Arc::new(LogProgress {
        label: "cg_train".into(),
    })];

    let fit = match &config.sliding {
        Some(sliding) => {
            let plan = SlidingWindowPlan::new(
                data.nrows(),
                sliding.window,
                sliding.stride,
                sliding.iterations.clone(),
            )
            .map_err(|e| e.to_string())?;
            let mut trainer = SlidingWindowTrainer::new(grid.clone(), plan);
            if let Some(initial) = sliding.initial_iterations {
                trainer = trainer.with_initial_fit(initial);
            }
            let outcomes = trainer
                .run(&data, &config.fit, &mut rng, &sinks, Some(&mut writer))
                .map_err(|e| e.to_string())?;
            for outcome in &outcomes {
                info!(
                    "window {} [{}, {}) trained in {:.1} ms",
                    outcome.index,
                    outcome.first_index,
                    outcome.last_index,
                    outcome.fit.report.timing.total_ms
                );
            }
            outcomes
                .into_iter()
                .last()
                .map(|o| o.fit)
                .ok_or("Sliding plan produced no windows")?
        }
        None => grid
            .fit(&data, &config.fit, &mut rng, &sinks, Some(&mut writer))
            .map_err(|e| e.to_string())?,
    };

    info!(
        "fit finished: {} iterations in {:.1} ms (em {:.1} ms)",
        fit.report.iterations,
        fit.report.timing.total_ms,
        fit.report.timing.em_ms()
    );
    if let Some((index, ms)) = fit.report.timing.slowest_iteration() {
        info!("slowest iteration: {index} ({ms:.1} ms)");
    }
    if let Some(change) = fit.report.final_pi_change() {
        info!("last emission change (ssd): {change:.3e}");
    }
    write_json_file(&writer.dir().join("report.json"), &fit.report)?;
    write_display_outputs(&config, &grid, &fit, writer.dir())?;
    println!("Outputs written to {}", writer.dir().display());
    Ok(())
}

fn write_display_outputs(
    config: &TrainingConfig,
    grid: &CountingGrid,
    fit: &FitResult,
    dir: &Path,
) -> Result<(), String> {
    let (display_pi, q, id_layer) = match &fit.layered {
        Some(bundle) => (&bundle.pi2_idf, &bundle.q, bundle.id_layer.clone()),
        None => (&fit.pi, &fit.q, vec![0; fit.q.documents()]),
    };

    if config.output.artifacts {
        let terms = top_terms(display_pi, &config.artifacts);
        write_json_file(&dir.join("top_terms.json"), &terms)?;
        let docs = doc_map(
            q,
            &id_layer,
            grid.geometry(),
            config.artifacts.doc_map_threshold,
        )
        .map_err(|e| e.to_string())?;
        write_json_file(&dir.join("doc_map.json"), &docs)?;
        info!("display artifacts written to {}", dir.display());
    }

    for &z in &config.output.heatmap_terms {
        let path = dir.join(format!("term_{z}.png"));
        save_term_heatmap(display_pi, z, &path)?;
    }
    Ok(())
}
