use crate::domain::{EnvOverrides, SessionSpec};
use std::path::{Path, PathBuf};

pub const DEFAULT_TRAIN_GAMES: u64 = 100;
pub const DEFAULT_EVAL_GAMES: u64 = 50;
pub const DEFAULT_MISSION: &str = "only_war";
/// Sequential repetitions of an 8x request.
pub const EIGHT_X_RUNS: u32 = 8;

const TRAIN_SCRIPT: &str = "train.py";
const EVAL_SCRIPT: &str = "eval.py";
const GYM_MODULE_DIR: &str = "gym_mod";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrainMode {
    Standard,
    EightX,
    SelfPlay,
}

impl TrainMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" | "train" => Some(Self::Standard),
            "8x" | "train8" | "eightx" => Some(Self::EightX),
            "selfplay" | "self-play" => Some(Self::SelfPlay),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Standard => "TRAIN",
            Self::EightX => "TRAIN8",
            Self::SelfPlay => "SELFPLAY",
        }
    }

    pub fn default_runs(self) -> u32 {
        match self {
            Self::EightX => EIGHT_X_RUNS,
            Self::Standard | Self::SelfPlay => 1,
        }
    }

    fn apply_env(self, env: &mut EnvOverrides) {
        match self {
            Self::Standard => {}
            Self::EightX => env.set("VEC_ENV_COUNT", EIGHT_X_RUNS.to_string()),
            Self::SelfPlay => env.set("SELF_PLAY_ENABLED", "1"),
        }
    }
}

/// Where scripts live and which interpreter runs them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchContext {
    pub repo_root: PathBuf,
    pub python: PathBuf,
}

impl LaunchContext {
    pub fn new(repo_root: impl Into<PathBuf>, python: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            python: python.into(),
        }
    }

    fn base_spec(&self, tag: &str, script: &str) -> SessionSpec {
        let spec = SessionSpec::new(tag, &self.python)
            .args(["-u", script])
            .working_dir(&self.repo_root);
        spec.env("PYTHONPATH", gym_module_path(&self.repo_root))
    }
}

fn gym_module_path(repo_root: &Path) -> String {
    repo_root.join(GYM_MODULE_DIR).to_string_lossy().into_owned()
}

/// Training logging switches. Speed mode turns all script-side logging off.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TrainLogging {
    pub speed_mode: bool,
    pub train_debug: bool,
    pub fight_report: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrainRequest {
    pub mode: TrainMode,
    pub games: u64,
    pub mission: Option<String>,
    pub logging: TrainLogging,
    pub resume_checkpoint: Option<PathBuf>,
    /// Fixed self-play opponent; only meaningful for `TrainMode::SelfPlay`.
    pub fixed_opponent: Option<PathBuf>,
    pub extra_env: EnvOverrides,
}

impl TrainRequest {
    pub fn new(mode: TrainMode) -> Self {
        Self {
            mode,
            games: DEFAULT_TRAIN_GAMES,
            mission: None,
            logging: TrainLogging::default(),
            resume_checkpoint: None,
            fixed_opponent: None,
            extra_env: EnvOverrides::new(),
        }
    }

    pub fn build(&self, context: &LaunchContext) -> SessionSpec {
        let mut spec = context
            .base_spec(self.mode.tag(), TRAIN_SCRIPT)
            .expected_total(self.games);
        let env = &mut spec.env;

        let logging_flag = if self.logging.speed_mode { "0" } else { "1" };
        for key in [
            "TRAIN_LOG_ENABLED",
            "TRAIN_LOG_TO_CONSOLE",
            "TRAIN_LOG_TO_FILE",
            "REWARD_DEBUG",
        ] {
            env.set(key, logging_flag);
        }
        env.set(
            "LOG_EVERY",
            if self.logging.speed_mode { "1000" } else { "500" },
        );
        if self.logging.train_debug {
            env.set("TRAIN_DEBUG", "1");
        }
        if self.logging.fight_report {
            env.set("FIGHT_REPORT", "1");
        }

        env.set("PER_ENABLED", "1");
        env.set("N_STEP", "3");
        env.set("SAVE_EVERY", "500");
        env.set("CLIP_REWARD", "1");
        env.set(
            "MISSION_NAME",
            self.mission.as_deref().unwrap_or(DEFAULT_MISSION),
        );
        self.mode.apply_env(env);

        if let Some(path) = &self.resume_checkpoint {
            env.set("RESUME_CHECKPOINT", path.to_string_lossy());
        }
        if self.mode == TrainMode::SelfPlay {
            if let Some(path) = &self.fixed_opponent {
                env.set("SELF_PLAY_OPPONENT_MODE", "fixed_checkpoint");
                env.set("SELF_PLAY_FIXED_PATH", path.to_string_lossy());
            }
        }
        env.extend(&self.extra_env);
        spec
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EvalRequest {
    pub model: PathBuf,
    pub games: u64,
    pub mission: Option<String>,
}

impl EvalRequest {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            games: DEFAULT_EVAL_GAMES,
            mission: None,
        }
    }

    pub fn build(&self, context: &LaunchContext) -> SessionSpec {
        let mut spec = context
            .base_spec("EVAL", EVAL_SCRIPT)
            .args([
                "--games".to_string(),
                self.games.to_string(),
                "--model".to_string(),
                self.model.to_string_lossy().into_owned(),
            ])
            .expected_total(self.games)
            .env("FORCE_GREEDY", "1")
            .env("EVAL_EPSILON", "0");
        spec.env.set(
            "MISSION_NAME",
            self.mission.as_deref().unwrap_or(DEFAULT_MISSION),
        );
        spec
    }
}
