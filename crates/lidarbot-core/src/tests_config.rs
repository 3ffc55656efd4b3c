use std::io::Write;

use crate::{
    Action, ActuationStyle, ConfigError, DangerSector, FilterStage, PolicyKind, RoverConfig, SectorKind,
    SectorLayout,
};

#[test]
fn defaults_are_valid() {
    let cfg = RoverConfig::default();
    cfg.validate().unwrap();
    assert_eq!(cfg.features.width, 360);
    assert_eq!(cfg.policy.kind, PolicyKind::RuleBased);
    assert_eq!(cfg.policy.actions.len(), 4);
    assert_eq!(cfg.cooldown.min_interval_us(), 100_000);
    assert_eq!(cfg.policy.rule_based.effective_sectors(), SectorLayout::NarrowAhead.sectors());
    assert_eq!(cfg.sensor.filter_stage, FilterStage::Producer);
}

#[test]
fn parses_partial_toml() {
    let cfg = RoverConfig::from_toml_str(
        r#"
        [features]
        width = 180

        [policy]
        kind = "learned"
        actions = ["forward", "left", "right", "stop", "reverse"]

        [policy.learned]
        model_path = "models/avoid.json"

        [policy.rule_based]
        safe_distance_mm = 350.0
        sectors = [
            { kind = "left", start_deg = 300.0, end_deg = 30.0 },
            { kind = "ahead", start_deg = 30.0, end_deg = 150.0 },
        ]

        [actuator]
        style = "continuous"

        [capture.keys]
        x = "reverse"
        "#,
    )
    .unwrap();

    assert_eq!(cfg.features.width, 180);
    assert_eq!(cfg.policy.kind, PolicyKind::Learned);
    assert_eq!(cfg.policy.actions.index_of(Action::Reverse), Some(4));
    assert_eq!(cfg.policy.learned.model_path.to_str(), Some("models/avoid.json"));
    assert_eq!(
        cfg.policy.rule_based.effective_sectors(),
        vec![
            DangerSector::new(SectorKind::Left, 300.0, 30.0),
            DangerSector::new(SectorKind::Ahead, 30.0, 150.0),
        ]
    );
    assert_eq!(cfg.actuator.style, ActuationStyle::Continuous);
    assert_eq!(cfg.capture.keys.get("x"), Some(&Action::Reverse));
    // untouched sections keep their defaults
    assert_eq!(cfg.control.staleness_ms, 1000);
    assert_eq!(cfg.actuator.forward_pulse_ms, 200);
}

fn invalid(toml: &str) -> String {
    match RoverConfig::from_toml_str(toml) {
        Err(ConfigError::Invalid(msg)) => msg,
        other => panic!("expected invalid config, got {other:?}"),
    }
}

#[test]
fn rejects_bad_values() {
    assert!(invalid("[features]\nwidth = 0").contains("width"));
    assert!(invalid("[cooldown]\nobstacle_cooldown_s = -1.0").contains("cooldown"));
    assert!(invalid("[policy]\nactions = []").contains("actions"));
    assert!(invalid("[policy]\nactions = [\"left\", \"left\"]").contains("twice"));
    assert!(invalid("[policy.rule_based]\nsafe_distance_mm = 0.0").contains("safe_distance_mm"));
    assert!(invalid("[policy.rule_based]\nsectors = []").contains("sector"));
    assert!(invalid(
        "[policy.rule_based]\nsectors = [{ kind = \"ahead\", start_deg = 90.0, end_deg = 90.0 }]"
    )
    .contains("empty"));
    assert!(invalid(
        "[policy.rule_based]\nsectors = [{ kind = \"ahead\", start_deg = 10.0, end_deg = 400.0 }]"
    )
    .contains("bounds"));
    assert!(invalid("[actuator]\nturn_pulse_ms = 0").contains("pulse"));
    assert!(invalid("[control]\nstaleness_ms = 0").contains("staleness"));
    assert!(invalid("[capture]\nquit_key = \"esc\"").contains("quit_key"));
    assert!(invalid("[capture.keys]\nq = \"stop\"").contains("quit key"));
    assert!(invalid("[capture.keys]\nr = \"reverse\"").contains("policy.actions"));
}

#[test]
fn unknown_action_fails_to_load() {
    let err = RoverConfig::from_toml_str("[policy]\nactions = [\"jump\"]").unwrap_err();
    assert!(matches!(err, ConfigError::Load(_)));
}

#[test]
fn rendered_defaults_load_back() {
    let mut cfg = RoverConfig::default();
    cfg.policy.rule_based.layout = SectorLayout::ThreeWay;
    cfg.sensor.min_frame_samples = 40;
    let text = cfg.to_toml_string().unwrap();
    assert!(text.contains("three-way"));

    let back = RoverConfig::from_toml_str(&text).unwrap();
    assert_eq!(back.policy.rule_based.effective_sectors(), SectorLayout::ThreeWay.sectors());
    assert_eq!(back.sensor.min_frame_samples, 40);
    assert_eq!(back.capture.keys, cfg.capture.keys);
    assert_eq!(back.policy.actions, cfg.policy.actions);
}

#[test]
fn load_merges_file_and_environment() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[policy.rule_based]\nsafe_distance_mm = 300.0\n\n[cooldown]\nobstacle_cooldown_s = 0.5").unwrap();

    std::env::set_var("LIDARBOT_COOLDOWN__OBSTACLE_COOLDOWN_S", "0.25");
    let cfg = RoverConfig::load(Some(file.path()));
    std::env::remove_var("LIDARBOT_COOLDOWN__OBSTACLE_COOLDOWN_S");
    let cfg = cfg.unwrap();

    assert_eq!(cfg.policy.rule_based.safe_distance_mm, 300.0);
    assert_eq!(cfg.cooldown.min_interval_us(), 250_000);

    let missing = file.path().with_extension("missing.toml");
    assert!(matches!(RoverConfig::load(Some(&missing)), Err(ConfigError::Load(_))));
}
