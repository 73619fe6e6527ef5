pub mod bank;
pub mod ccp;
pub mod default_fund;
pub mod margin;
