use dyadsync_core::{MarkerBinding, Participant, TrialData};
use dyadsync_experiment::{
    Block, Constraint, JsonCollector, Phase, Procedure, RandomizationConfig, RandomizationMethod,
    ResponseRecord, ResultCollector, Timeline, TrialList,
};

fn timeline() -> Timeline {
    let procedure = Procedure::new("Emotion")
        .with_phase(Phase::fixation(3.0).with_binding(MarkerBinding::new("phase_start", "100#", None).unwrap()))
        .with_phase(Phase::video("{video1}", "{video2}"))
        .with_phase(
            Phase::rating(1, 7)
                .with_binding(MarkerBinding::new("p1_response", "300#0$", Some(Participant::P1)).unwrap()),
        );
    let rows = (0..4).map(|i| {
        let mut row = TrialData::new();
        row.insert("video1".into(), format!("p1_{i}.mp4").into());
        row.insert("video2".into(), format!("p2_{i}.mp4").into());
        row.insert("emotion".into(), if i % 2 == 0 { "happy" } else { "sad" }.into());
        row
    });
    let randomization = RandomizationConfig::new(RandomizationMethod::Constrained, Some(9)).with_constraint(
        Constraint::MaxConsecutive {
            attribute: "emotion".into(),
            value: None,
            limit: 1,
        },
    );

    Timeline::new("Pilot")
        .with_block(Block::simple(
            "Intro",
            Procedure::new("Welcome").with_phase(Phase::instruction("Welcome")),
        ))
        .with_block(Block::trial_based("Main", procedure, TrialList::from_rows(rows)).with_randomization(randomization))
}

#[test]
fn timeline_survives_a_json_round_trip() {
    let original = timeline();
    let json = serde_json::to_string_pretty(&original).unwrap();
    let back: Timeline = serde_json::from_str(&json).unwrap();
    assert_eq!(back, original);

    let procedure = original.blocks[1].procedure.clone().unwrap();
    let back: Procedure = serde_json::from_str(&serde_json::to_string(&procedure).unwrap()).unwrap();
    assert_eq!(back, procedure);
}

#[test]
fn saved_timeline_loads_from_disk() {
    let dir = std::env::temp_dir().join(format!("dyadsync-persist-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("timeline.json");
    timeline().save(&path).unwrap();
    assert_eq!(Timeline::load(&path).unwrap(), timeline());
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn unknown_phase_type_is_a_load_error() {
    let json = r#"{
        "metadata": {"name": "Broken"},
        "blocks": [{"name": "B", "procedure": {"name": "P", "phases": [{"type": "MysteryPhase"}]}}]
    }"#;
    assert!(serde_json::from_str::<Timeline>(json).is_err());
}

#[test]
fn json_collector_checkpoints_every_response() {
    let dir = std::env::temp_dir().join(format!("dyadsync-results-{}", std::process::id()));
    let path = dir.join("nested").join("results.json");
    let mut collector = JsonCollector::create(&path, "Pilot").unwrap();
    collector
        .add_response(ResponseRecord::new(Participant::P2, 4, 6, Some(1.25), TrialData::new()))
        .unwrap();

    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["experiment"], "Pilot");
    assert_eq!(saved["responses"][0]["trial_id"], 4);
    assert_eq!(saved["responses"][0]["response"], 6);
    std::fs::remove_dir_all(&dir).unwrap();
}
