pub mod forge_agent;
