//! Inverted pendulum swing-up with continuous torque

use std::f64::consts::PI;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use super::{Action, ActionSpace, EnvSpec, Environment, Observation, Step, invalid_action};
use crate::error::ModelResult;

const MAX_SPEED: f64 = 8.0;
const MAX_TORQUE: f64 = 2.0;
const DT: f64 = 0.05;
const GRAVITY: f64 = 10.0;
const MASS: f64 = 1.0;
const LENGTH: f64 = 1.0;

pub struct Pendulum {
    spec: EnvSpec,
    theta: f64,
    theta_dot: f64,
    step_count: usize,
}

impl Pendulum {
    pub const NAME: &'static str = "Pendulum-v1";

    pub fn new() -> Self {
        Self {
            spec: Self::spec(),
            theta: 0.0,
            theta_dot: 0.0,
            step_count: 0,
        }
    }

    pub fn spec() -> EnvSpec {
        EnvSpec {
            name: Self::NAME.to_string(),
            observation_size: 3,
            action_space: ActionSpace::Continuous(1),
            max_steps: 200,
            solved_threshold: -200.0,
        }
    }

    fn observation(&self) -> Observation {
        vec![
            self.theta.cos() as f32,
            self.theta.sin() as f32,
            self.theta_dot as f32,
        ]
    }
}

impl Default for Pendulum {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap an angle into [-PI, PI)
fn angle_normalize(x: f64) -> f64 {
    (x + PI).rem_euclid(2.0 * PI) - PI
}

impl Environment for Pendulum {
    fn reset(&mut self, seed: u64) -> ModelResult<Observation> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        self.theta = rng.gen_range(-PI..PI);
        self.theta_dot = rng.gen_range(-1.0..1.0);
        self.step_count = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: &Action) -> ModelResult<Step> {
        // Controller output lives in [-1, 1]; scale to the torque range
        let torque = match action {
            Action::Continuous(v) if !v.is_empty() => {
                (v[0] as f64 * MAX_TORQUE).clamp(-MAX_TORQUE, MAX_TORQUE)
            }
            other => return Err(invalid_action(Self::NAME, other)),
        };

        let cost = angle_normalize(self.theta).powi(2)
            + 0.1 * self.theta_dot.powi(2)
            + 0.001 * torque.powi(2);

        let theta_acc =
            3.0 * GRAVITY / (2.0 * LENGTH) * self.theta.sin() + 3.0 / (MASS * LENGTH * LENGTH) * torque;
        self.theta_dot = (self.theta_dot + theta_acc * DT).clamp(-MAX_SPEED, MAX_SPEED);
        self.theta += self.theta_dot * DT;
        self.step_count += 1;

        Ok(Step {
            observation: self.observation(),
            reward: -cost,
            terminated: false,
            truncated: self.step_count >= self.spec.max_steps,
        })
    }

    fn spec(&self) -> &EnvSpec {
        &self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angle_normalize() {
        assert!((angle_normalize(2.5 * PI) - 0.5 * PI).abs() < 1e-9);
        assert!((angle_normalize(0.5) - 0.5).abs() < 1e-9);
        assert!((angle_normalize(-0.5) + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_rewards_are_non_positive() {
        let mut env = Pendulum::new();
        env.reset(3).unwrap();
        for _ in 0..50 {
            let step = env.step(&Action::Continuous(vec![0.3])).unwrap();
            assert!(step.reward <= 0.0);
            assert!(!step.terminated);
        }
    }

    #[test]
    fn test_truncates_at_step_cap() {
        let mut env = Pendulum::new();
        env.reset(0).unwrap();
        let mut last = None;
        for _ in 0..200 {
            last = Some(env.step(&Action::Continuous(vec![0.0])).unwrap());
        }
        assert!(last.unwrap().truncated);
    }

    #[test]
    fn test_discrete_action_rejected() {
        let mut env = Pendulum::new();
        env.reset(0).unwrap();
        assert!(env.step(&Action::Discrete(0)).is_err());
    }
}
