//! Offline walk through the aggregation pipeline on a synthetic task grid.
//!
//! Run with: RUST_LOG=debug cargo run --example choropleth_grid

use fair_task_insights::{
    aggregate_streaming, build_legend, count_points, normalize_geometry, summarize, AggregationConfig,
    Bounds, Choropleth, PointIndex, Task, TaskStatus,
};
use geo::{MultiPolygon, Point};
use geojson::{GeoJson, Geometry, Value};
use tokio_util::sync::CancellationToken;

/// 3x3 grid of 0.01 degree cells near Kampala.
fn grid() -> Vec<Task> {
    let statuses = [TaskStatus::Ready, TaskStatus::Mapped, TaskStatus::Validated];
    let mut tasks = Vec::new();
    for row in 0..3 {
        for col in 0..3 {
            let bounds = Bounds {
                min_lng: 32.58 + col as f64 * 0.01,
                max_lng: 32.59 + col as f64 * 0.01,
                min_lat: 0.31 + row as f64 * 0.01,
                max_lat: 0.32 + row as f64 * 0.01,
            };
            let id = (row * 3 + col + 1) as u64;
            tasks.push(Task::new(id, statuses[col], MultiPolygon::new(vec![bounds.to_polygon()])));
        }
    }
    tasks
}

/// Points clustered towards the north-east corner.
fn predictions() -> Vec<Point<f64>> {
    let mut points = Vec::new();
    for i in 0..300u32 {
        let t = (i as f64 * 0.618_034).fract();
        let s = (i as f64 * 0.414_214).fract();
        points.push(Point::new(32.58 + 0.03 * t.sqrt(), 0.31 + 0.03 * s.sqrt()));
    }
    points
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> fair_task_insights::Result<()> {
    env_logger::init();

    // Boundary made of two overlapping squares
    let boundary = GeoJson::Geometry(Geometry::new(Value::MultiPolygon(vec![
        vec![vec![vec![32.58, 0.31], vec![32.60, 0.31], vec![32.60, 0.33], vec![32.58, 0.33], vec![32.58, 0.31]]],
        vec![vec![vec![32.59, 0.32], vec![32.61, 0.32], vec![32.61, 0.34], vec![32.59, 0.34], vec![32.59, 0.32]]],
    ])));

    println!("Choropleth Grid Example\n");
    match normalize_geometry(&boundary) {
        Some(normalized) => println!(
            "Boundary: {} exterior vertices (bounding-box fallback: {})\n",
            normalized.polygon().exterior().0.len(),
            normalized.is_fallback()
        ),
        None => println!("Boundary: no usable geometry\n"),
    }

    let tasks = grid();
    let points = predictions();

    // Batch mode
    let batch = count_points(&tasks, &points);
    println!("1. Batch aggregation:");
    for (task_id, count) in &batch.task_counts {
        println!("   task {:>2}: {}", task_id, count);
    }

    // Streaming mode over an in-memory index
    let mut index = PointIndex::from_points(&points);
    let streamed =
        aggregate_streaming(&tasks, &mut index, &AggregationConfig::default(), &CancellationToken::new())
            .await?;
    println!("\n2. Streaming aggregation matches batch: {}", streamed.task_counts == batch.task_counts);

    let summary = summarize(&batch);
    println!("\n3. Summary:");
    println!("   {}", summary.headline());
    println!("   peak {} | average per active task {}", summary.peak, summary.average_per_active_task);

    let choropleth = Choropleth::from_result(&batch);
    println!("\n4. Legend:");
    for entry in build_legend(batch.max_count) {
        println!("   {:>9}  {}", entry.label(), entry.color);
    }
    println!("\n5. Task colours:");
    for task in &tasks {
        println!("   task {:>2}: {}", task.task_id, choropleth.color_for(batch.count_for(task.task_id)));
    }

    Ok(())
}
