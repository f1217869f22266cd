//! Artifacts on disk feeding the perception -> dynamics loop

use yume_models::artifact::{self, Artifact};
use yume_models::env::{self, CartPole};
use yume_models::{Action, Dynamics, LinearEncoder, LstmDynamics, ModelError, Perception};

#[test]
fn test_ron_and_bincode_artifacts_load_identically() {
    let dir = tempfile::tempdir().unwrap();
    let encoder = LinearEncoder::random(4, 3, 7);
    let observation = [0.01, -0.2, 0.03, 0.4];

    for name in ["perception.ron", "perception.bin"] {
        let path = dir.path().join(name);
        artifact::save(&encoder, &path).unwrap();
        let loaded: LinearEncoder = artifact::load(&path).unwrap();
        assert_eq!(
            loaded.encode(&observation).unwrap(),
            encoder.encode(&observation).unwrap(),
            "{} changed the encoder",
            name
        );
    }
}

#[test]
fn test_invalid_artifact_is_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dynamics.ron");
    let mut dynamics = LstmDynamics::random(3, 2, 4, 1);
    artifact::save(&dynamics, &path).unwrap();

    // Truncate a weight buffer behind the loader's back
    dynamics.bias.pop();
    let text = ron::ser::to_string(&dynamics).unwrap();
    std::fs::write(&path, text).unwrap();

    assert!(dynamics.validate().is_err());
    assert!(matches!(
        artifact::load::<LstmDynamics>(&path),
        Err(ModelError::ArtifactLoad { .. })
    ));
}

#[test]
fn test_encode_and_advance_through_cartpole_episode() {
    let spec = env::spec(CartPole::NAME).unwrap();
    let encoder = LinearEncoder::random(spec.observation_size, 5, 2);
    let dynamics = LstmDynamics::random(5, spec.action_space.size(), 8, 3);

    let mut cartpole = env::make(CartPole::NAME).unwrap();
    let mut observation = cartpole.reset(42).unwrap();
    let mut state = dynamics.initial_state();

    let mut steps = 0;
    loop {
        let latent = encoder.encode(&observation).unwrap();
        assert_eq!(latent.len(), 5);

        // Alternate pushes; the pole still falls eventually
        let action = Action::Discrete(steps % 2);
        let step = cartpole.step(&action).unwrap();
        state = dynamics.step(&latent, &action, &state).unwrap();
        assert_eq!(state.h.len(), 8);
        assert!(state.h.iter().all(|v| v.abs() <= 1.0));

        steps += 1;
        if step.done() {
            break;
        }
        observation = step.observation;
    }
    assert!(steps <= spec.max_steps);
}
