pub mod catalog;
pub mod marker;
pub mod marker_log;
pub mod outcome;
pub mod trial;

pub use catalog::{CatalogError, MarkerCatalog, MarkerDefinition, MarkerKind};
pub use marker::{
    MarkerBinding, MarkerSink, MarkerValue, Participant, TemplateError, resolve_marker_template,
    template_variables, validate_template_syntax,
};
pub use marker_log::{MarkerEvent, MarkerLog};
pub use outcome::{
    FrameSummary, InstructionResult, PhaseOutcome, PhaseResults, RatingResult, SyncSummary,
    TimedResult, VideoResult,
};
pub use trial::{
    FieldValue, TRIAL_ID, TRIAL_INDEX, Trial, TrialData, normalize_fields, trial_index,
    wall_clock_secs,
};
