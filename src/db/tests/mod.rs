mod migrations;
mod state;
