use thiserror::Error;

#[derive(Debug, Error)]
pub enum PimError {
    // -- registration --------------------------------------------------------
    #[error("agent name must start with a letter, digit or underscore and contain only letters, digits, underscores and hyphens (max 50 chars)")]
    InvalidName,

    #[error("agent name '{0}' is already registered")]
    NameTaken(String),

    #[error("lost registration race for '{0}': registry file is owned by another process")]
    RaceLost(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("not registered; run `pim join` first")]
    NotRegistered,

    #[error("multiple registrations match this session ({0}); set PI_MESSENGER_NAME")]
    AmbiguousIdentity(String),

    // -- target validation ---------------------------------------------------
    #[error("agent '{0}' not found in registry")]
    NotFound(String),

    #[error("agent '{0}' is registered but its process is no longer alive")]
    NotActive(String),

    #[error("registration for '{0}' is unreadable: {1}")]
    InvalidRegistration(String, String),

    // -- swarm ---------------------------------------------------------------
    #[error("already holding a claim on {spec}#{task}; complete or unclaim it first")]
    AlreadyHaveClaim { spec: String, task: String },

    #[error("{spec}#{task} is already claimed by '{owner}'")]
    AlreadyClaimed {
        spec: String,
        task: String,
        owner: String,
    },

    #[error("{spec}#{task} is not claimed")]
    NotClaimed { spec: String, task: String },

    #[error("{spec}#{task} is claimed by '{owner}', not by you")]
    NotYourClaim {
        spec: String,
        task: String,
        owner: String,
    },

    #[error("{spec}#{task} was already completed by '{by}'")]
    AlreadyCompleted {
        spec: String,
        task: String,
        by: String,
    },

    #[error("no spec path given and none announced on this registration")]
    NoSpec,

    // -- crew ----------------------------------------------------------------
    #[error("a plan already exists for this project (PRD: {0})")]
    PlanExists(String),

    #[error("no plan in this project; run `pim plan` first")]
    NoPlan,

    #[error("no PRD found (looked for PRD.md, SPEC.md, REQUIREMENTS.md, DESIGN.md, PLAN.md at the root and under docs/)")]
    NoPrd,

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidStatus { from: String, to: String },

    #[error("task {task} has unmet dependencies: {pending}")]
    UnmetDependencies { task: String, pending: String },

    #[error("dependency {0} does not exist")]
    DependencyNotFound(String),

    #[error("dependency cycle through task {0}")]
    DependencyCycle(String),

    #[error("crew actions are disabled inside crew child processes")]
    CrewRecursion,

    // -- agent availability --------------------------------------------------
    #[error("no planner agent available (is `pi` on PATH?)")]
    NoPlanner,

    #[error("no worker agent available (is `pi` on PATH?)")]
    NoWorker,

    #[error("no reviewer agent available (is `pi` on PATH?)")]
    NoReviewer,

    #[error("no analyst agent available (is `pi` on PATH?)")]
    NoAnalyst,

    // -- orchestration -------------------------------------------------------
    #[error("analyst failed: {0}")]
    AnalystFailed(String),

    #[error("planner failed: {0}")]
    PlannerFailed(String),

    #[error("all scouts failed")]
    AllScoutsFailed,

    // -- locks ---------------------------------------------------------------
    #[error("locked by another process (pid {holder:?}): {path}")]
    Locked { path: String, holder: Option<u32> },

    // -- router --------------------------------------------------------------
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    // -- passthrough ---------------------------------------------------------
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

impl PimError {
    /// Stable machine-readable discriminator, surfaced as `details.error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName => "invalid_name",
            Self::NameTaken(_) => "name_taken",
            Self::RaceLost(_) => "race_lost",
            Self::RegistrationFailed(_) => "registration_failed",
            Self::NotRegistered => "not_registered",
            Self::AmbiguousIdentity(_) => "ambiguous_identity",
            Self::NotFound(_) => "not_found",
            Self::NotActive(_) => "not_active",
            Self::InvalidRegistration(_, _) => "invalid_registration",
            Self::AlreadyHaveClaim { .. } => "already_have_claim",
            Self::AlreadyClaimed { .. } => "already_claimed",
            Self::NotClaimed { .. } => "not_claimed",
            Self::NotYourClaim { .. } => "not_your_claim",
            Self::AlreadyCompleted { .. } => "already_completed",
            Self::NoSpec => "no_spec",
            Self::PlanExists(_) => "plan_exists",
            Self::NoPlan => "no_plan",
            Self::NoPrd => "no_prd",
            Self::TaskNotFound(_) => "not_found",
            Self::InvalidStatus { .. } => "invalid_status",
            Self::UnmetDependencies { .. } => "unmet_dependencies",
            Self::DependencyNotFound(_) => "dependency_not_found",
            Self::DependencyCycle(_) => "dependency_cycle",
            Self::CrewRecursion => "crew_recursion",
            Self::NoPlanner => "no_planner",
            Self::NoWorker => "no_worker",
            Self::NoReviewer => "no_reviewer",
            Self::NoAnalyst => "no_analyst",
            Self::AnalystFailed(_) => "analyst_failed",
            Self::PlannerFailed(_) => "planner_failed",
            Self::AllScoutsFailed => "all_scouts_failed",
            Self::Locked { .. } => "locked",
            Self::UnknownAction(_) => "unknown_action",
            Self::InvalidParams(_) => "invalid_params",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Git(_) => "git_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, PimError>;
