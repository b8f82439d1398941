//! Deep Q-Network agent: a small MLP over the environment state, an
//! experience replay buffer and a periodically synced target network.

use crate::config::{
    BATCH_SIZE, EPSILON_DECAY, EPSILON_END, EPSILON_START, GAMMA, HIDDEN_DIM, LEARNING_RATE,
    REPLAY_CAPACITY, TARGET_SYNC_STEPS,
};
use crate::environment::{StockEnv, TradeAction};
use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, Optimizer, VarBuilder, VarMap};
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::VecDeque;
use std::path::Path;

pub struct QNetwork {
    hidden1: Linear,
    hidden2: Linear,
    head: Linear,
}

impl QNetwork {
    pub fn new(state_dim: usize, hidden_dim: usize, num_actions: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden1: candle_nn::linear(state_dim, hidden_dim, vb.pp("hidden1"))?,
            hidden2: candle_nn::linear(hidden_dim, hidden_dim, vb.pp("hidden2"))?,
            head: candle_nn::linear(hidden_dim, num_actions, vb.pp("head"))?,
        })
    }
}

impl Module for QNetwork {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.hidden1.forward(xs)?.relu()?;
        let xs = self.hidden2.forward(&xs)?.relu()?;
        self.head.forward(&xs)
    }
}

#[derive(Clone, Debug)]
pub struct Transition {
    pub state: Vec<f32>,
    pub action: TradeAction,
    pub reward: f32,
    pub next_state: Vec<f32>,
    pub done: bool,
}

pub struct ReplayBuffer {
    buffer: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, transition: Transition) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(transition);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn sample<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<&Transition> {
        let amount = batch_size.min(self.buffer.len());
        rand::seq::index::sample(rng, self.buffer.len(), amount)
            .into_iter()
            .map(|i| &self.buffer[i])
            .collect()
    }
}

pub struct DqnAgent {
    device: Device,
    policy_vars: VarMap,
    policy: QNetwork,
    target_vars: VarMap,
    target: QNetwork,
    opt: candle_nn::AdamW,
    replay: ReplayBuffer,
    epsilon: f64,
    learn_steps: usize,
    rng: StdRng,
}

impl DqnAgent {
    pub fn new(device: &Device) -> Result<Self> {
        let state_dim = StockEnv::state_dim();

        let policy_vars = VarMap::new();
        let policy = QNetwork::new(
            state_dim,
            HIDDEN_DIM,
            TradeAction::COUNT,
            VarBuilder::from_varmap(&policy_vars, DType::F32, device),
        )?;
        let target_vars = VarMap::new();
        let target = QNetwork::new(
            state_dim,
            HIDDEN_DIM,
            TradeAction::COUNT,
            VarBuilder::from_varmap(&target_vars, DType::F32, device),
        )?;

        let params = candle_nn::ParamsAdamW {
            lr: LEARNING_RATE,
            ..Default::default()
        };
        let opt = candle_nn::AdamW::new(policy_vars.all_vars(), params)?;

        let agent = Self {
            device: device.clone(),
            policy_vars,
            policy,
            target_vars,
            target,
            opt,
            replay: ReplayBuffer::new(REPLAY_CAPACITY),
            epsilon: EPSILON_START,
            learn_steps: 0,
            rng: StdRng::from_entropy(),
        };
        agent.sync_target()?;
        Ok(agent)
    }

    /// Builds a greedy agent from saved policy weights.
    pub fn from_weights(path: &Path, device: &Device) -> Result<Self> {
        let mut agent = Self::new(device)?;
        agent.policy_vars.load(path)?;
        agent.sync_target()?;
        agent.epsilon = 0.0;
        Ok(agent)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.policy_vars.save(path)?;
        Ok(())
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn decay_epsilon(&mut self) {
        self.epsilon = (self.epsilon * EPSILON_DECAY).max(EPSILON_END);
    }

    pub fn q_values(&self, state: &[f32]) -> Result<Vec<f32>> {
        let xs = Tensor::from_slice(state, (1, state.len()), &self.device)?;
        Ok(self.policy.forward(&xs)?.squeeze(0)?.to_vec1::<f32>()?)
    }

    /// Epsilon-greedy when `explore` is set, greedy otherwise.
    pub fn act(&mut self, state: &[f32], explore: bool) -> Result<TradeAction> {
        if explore && self.rng.r#gen::<f64>() < self.epsilon {
            let idx = self.rng.gen_range(0..TradeAction::COUNT);
            return Ok(TradeAction::from_index(idx).unwrap_or(TradeAction::Hold));
        }
        let q = self.q_values(state)?;
        let best = q
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0;
        Ok(TradeAction::from_index(best).unwrap_or(TradeAction::Hold))
    }

    pub fn remember(&mut self, transition: Transition) {
        self.replay.push(transition);
    }

    /// One gradient step on a replay minibatch. `None` until the buffer holds a batch.
    pub fn learn(&mut self) -> Result<Option<f32>> {
        if self.replay.len() < BATCH_SIZE {
            return Ok(None);
        }

        let state_dim = StockEnv::state_dim();
        let batch = self.replay.sample(BATCH_SIZE, &mut self.rng);
        let n = batch.len();

        let mut states = Vec::with_capacity(n * state_dim);
        let mut next_states = Vec::with_capacity(n * state_dim);
        let mut actions = Vec::with_capacity(n);
        let mut rewards = Vec::with_capacity(n);
        let mut not_done = Vec::with_capacity(n);
        for t in &batch {
            states.extend_from_slice(&t.state);
            next_states.extend_from_slice(&t.next_state);
            actions.push(t.action.index() as u32);
            rewards.push(t.reward);
            not_done.push(if t.done { 0.0f32 } else { 1.0 });
        }

        let states = Tensor::from_vec(states, (n, state_dim), &self.device)?;
        let next_states = Tensor::from_vec(next_states, (n, state_dim), &self.device)?;
        let actions = Tensor::from_vec(actions, (n, 1), &self.device)?;
        let rewards = Tensor::from_vec(rewards, n, &self.device)?;
        let not_done = Tensor::from_vec(not_done, n, &self.device)?;

        let q_taken = self.policy.forward(&states)?.gather(&actions, 1)?.squeeze(1)?;
        let next_q = self.target.forward(&next_states)?.max(1)?;
        let bootstrap = next_q.mul(&not_done)?.affine(GAMMA, 0.0)?;
        let target = rewards.add(&bootstrap)?;

        let loss = candle_nn::loss::mse(&q_taken, &target)?;
        self.opt.backward_step(&loss)?;

        self.learn_steps += 1;
        if self.learn_steps % TARGET_SYNC_STEPS == 0 {
            self.sync_target()?;
        }

        Ok(Some(loss.to_scalar::<f32>()?))
    }

    fn sync_target(&self) -> Result<()> {
        let policy = self
            .policy_vars
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("policy weights lock poisoned"))?;
        let target = self
            .target_vars
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("target weights lock poisoned"))?;
        for (name, var) in target.iter() {
            if let Some(src) = policy.get(name) {
                var.set(src.as_tensor())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(i: usize) -> Transition {
        let dim = StockEnv::state_dim();
        Transition {
            state: vec![i as f32 * 0.01; dim],
            action: TradeAction::from_index(i % TradeAction::COUNT).unwrap(),
            reward: 0.5,
            next_state: vec![(i + 1) as f32 * 0.01; dim],
            done: i % 10 == 9,
        }
    }

    #[test]
    fn test_replay_buffer_capacity() {
        let mut buffer = ReplayBuffer::new(10);
        for i in 0..25 {
            buffer.push(transition(i));
        }
        assert_eq!(buffer.len(), 10);

        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(buffer.sample(4, &mut rng).len(), 4);
        assert_eq!(buffer.sample(40, &mut rng).len(), 10);
    }

    #[test]
    fn test_q_values_shape_and_greedy_action() {
        let mut agent = DqnAgent::new(&Device::Cpu).unwrap();
        let state = vec![0.1f32; StockEnv::state_dim()];
        let q = agent.q_values(&state).unwrap();
        assert_eq!(q.len(), TradeAction::COUNT);

        let a = agent.act(&state, false).unwrap();
        let b = agent.act(&state, false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_learn_waits_for_full_batch() {
        let mut agent = DqnAgent::new(&Device::Cpu).unwrap();
        for i in 0..BATCH_SIZE - 1 {
            agent.remember(transition(i));
        }
        assert!(agent.learn().unwrap().is_none());

        agent.remember(transition(BATCH_SIZE));
        let loss = agent.learn().unwrap();
        assert!(loss.is_some_and(|l| l.is_finite()));
    }

    #[test]
    fn test_epsilon_decays_to_floor() {
        let mut agent = DqnAgent::new(&Device::Cpu).unwrap();
        for _ in 0..200 {
            agent.decay_epsilon();
        }
        assert_eq!(agent.epsilon(), EPSILON_END);
    }

    #[test]
    fn test_weights_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let agent = DqnAgent::new(&Device::Cpu).unwrap();
        agent.save(&path).unwrap();

        let loaded = DqnAgent::from_weights(&path, &Device::Cpu).unwrap();
        let state = vec![0.3f32; StockEnv::state_dim()];
        assert_eq!(agent.q_values(&state).unwrap(), loaded.q_values(&state).unwrap());
        assert_eq!(loaded.epsilon(), 0.0);
    }
}
