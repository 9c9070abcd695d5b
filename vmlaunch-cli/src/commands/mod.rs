pub mod check;
pub mod prepare;
pub mod run;
pub mod status;
pub mod stop;
