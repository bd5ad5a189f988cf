use chrono::Utc;
use dt_types::*;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Detour basic usage example");

    // Describe a problem
    let config = DriverConfig::new("paraboloid")
        .with_design_variable(DesignVariable::scalar("x", 50.0).with_bounds(-50.0, 50.0))
        .with_design_variable(DesignVariable::scalar("y", 50.0).with_bounds(-50.0, 50.0))
        .with_objective(ObjectiveDecl::minimize("f_xy"))
        .with_constraint(ConstraintDecl::lower("c", 15.0))
        .with_max_consecutive_recoverable(5);
    config.validate()?;
    println!("Config:\n{}", config.to_json_pretty()?);

    // Classify a few evaluation attempts
    let records = vec![
        EvaluationRecord {
            index: 0,
            iteration: 0,
            design_point: DesignPoint::new().with_scalar("x", 50.0).with_scalar("y", 50.0),
            outcome: Outcome::Success(
                Response::new()
                    .with_objective("f_xy", [7069.0])
                    .with_constraint("c", [0.0]),
            ),
            started_at: Utc::now(),
            wall_time: Duration::from_micros(40),
        },
        EvaluationRecord {
            index: 1,
            iteration: 1,
            design_point: DesignPoint::new().with_scalar("x", -35.0).with_scalar("y", -50.0),
            outcome: Outcome::RecoverableFailure {
                reason: "point lies in the invalid region".into(),
            },
            started_at: Utc::now(),
            wall_time: Duration::from_micros(12),
        },
    ];

    for record in &records {
        println!("#{} {} -> {}", record.index, record.design_point, record.kind());
    }

    let summary = HistorySummary::from_records(&records);
    println!("Summary: {summary}");

    Ok(())
}
