pub mod jobworker;
