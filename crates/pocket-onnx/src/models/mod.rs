pub mod flow_lm;
pub mod mimi;
