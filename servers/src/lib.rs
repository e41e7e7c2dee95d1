pub mod chat_logic;
