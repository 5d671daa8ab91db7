pub mod delay;
pub mod echo;
pub mod fail;
pub mod shell;
