//! Classic cart-pole balancing task

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use super::{Action, ActionSpace, EnvSpec, Environment, Observation, Step, invalid_action};
use crate::error::ModelResult;

const GRAVITY: f64 = 9.8;
const CART_MASS: f64 = 1.0;
const POLE_MASS: f64 = 0.1;
const TOTAL_MASS: f64 = CART_MASS + POLE_MASS;
const POLE_HALF_LENGTH: f64 = 0.5;
const FORCE_MAG: f64 = 10.0;
const TAU: f64 = 0.02;
const X_THRESHOLD: f64 = 2.4;
const THETA_THRESHOLD: f64 = 12.0 * std::f64::consts::PI / 180.0;

pub struct CartPole {
    spec: EnvSpec,
    /// x, x_dot, theta, theta_dot
    state: [f64; 4],
    step_count: usize,
}

impl CartPole {
    pub const NAME: &'static str = "CartPole-v1";

    pub fn new() -> Self {
        Self {
            spec: Self::spec(),
            state: [0.0; 4],
            step_count: 0,
        }
    }

    pub fn spec() -> EnvSpec {
        EnvSpec {
            name: Self::NAME.to_string(),
            observation_size: 4,
            action_space: ActionSpace::Discrete(2),
            max_steps: 500,
            solved_threshold: 475.0,
        }
    }

    fn observation(&self) -> Observation {
        self.state.iter().map(|&v| v as f32).collect()
    }
}

impl Default for CartPole {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for CartPole {
    fn reset(&mut self, seed: u64) -> ModelResult<Observation> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        for value in &mut self.state {
            *value = rng.gen_range(-0.05..0.05);
        }
        self.step_count = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: &Action) -> ModelResult<Step> {
        let force = match action {
            Action::Discrete(1) => FORCE_MAG,
            Action::Discrete(0) => -FORCE_MAG,
            other => return Err(invalid_action(Self::NAME, other)),
        };

        let [x, x_dot, theta, theta_dot] = self.state;
        let (sin_theta, cos_theta) = theta.sin_cos();

        let temp =
            (force + POLE_MASS * POLE_HALF_LENGTH * theta_dot * theta_dot * sin_theta) / TOTAL_MASS;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (POLE_HALF_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta * cos_theta / TOTAL_MASS));
        let x_acc = temp - POLE_MASS * POLE_HALF_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

        // Euler integration
        self.state = [
            x + TAU * x_dot,
            x_dot + TAU * x_acc,
            theta + TAU * theta_dot,
            theta_dot + TAU * theta_acc,
        ];
        self.step_count += 1;

        let terminated = self.state[0].abs() > X_THRESHOLD || self.state[2].abs() > THETA_THRESHOLD;
        let truncated = self.step_count >= self.spec.max_steps;

        Ok(Step {
            observation: self.observation(),
            // Every step pays 1, including the one that ends the episode
            reward: 1.0,
            terminated,
            truncated,
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
    fn test_reset_is_seeded() {
        let mut a = CartPole::new();
        let mut b = CartPole::new();
        assert_eq!(a.reset(7).unwrap(), b.reset(7).unwrap());
        assert_ne!(a.reset(7).unwrap(), a.reset(8).unwrap());
    }

    #[test]
    fn test_initial_state_is_small() {
        let mut env = CartPole::new();
        let obs = env.reset(42).unwrap();
        assert_eq!(obs.len(), 4);
        assert!(obs.iter().all(|v| v.abs() <= 0.05));
    }

    #[test]
    fn test_constant_push_terminates() {
        let mut env = CartPole::new();
        env.reset(1).unwrap();
        let mut steps = 0;
        let mut total = 0.0;
        loop {
            let step = env.step(&Action::Discrete(1)).unwrap();
            steps += 1;
            total += step.reward;
            assert_eq!(step.reward, 1.0);
            if step.done() {
                assert!(step.terminated);
                break;
            }
        }
        assert!(steps < 200, "pushing one way should topple the pole quickly");
        // Return counts every step, the toppling one included
        assert_eq!(total, steps as f64);
    }

    #[test]
    fn test_rejects_out_of_range_action() {
        let mut env = CartPole::new();
        env.reset(0).unwrap();
        assert!(env.step(&Action::Discrete(3)).is_err());
        assert!(env.step(&Action::Continuous(vec![1.0])).is_err());
    }
}
