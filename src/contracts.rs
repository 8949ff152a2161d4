//! VeilSettlement contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the
//! settlement contract on the EVM side.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Settlement contract interface: escrow payouts, claim bookkeeping,
    /// and evidence-backed finalization.
    #[sol(rpc)]
    contract VeilSettlement {
        /// Pay out a transfer from escrow to the recipient.
        /// Called by the relayer with its attestation over msgId.
        ///
        /// # Arguments
        /// * `msgId` - Canonical message identifier
        /// * `token` - Token address on this chain
        /// * `to` - Recipient address
        /// * `amount` - Amount in this chain's decimals
        /// * `v`, `r`, `s` - Relayer attestation signature over msgId
        function payout(
            bytes32 msgId,
            address token,
            address to,
            uint256 amount,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;

        /// Finalize a solver-mediated transfer with delivery evidence,
        /// releasing the solver's bond.
        function verifyAndSettle(
            bytes32 msgId,
            bytes32 destTxRef,
            bytes32 evidenceHash,
            string solver
        ) external;

        /// Slash the bond of an expired, undelivered claim.
        function slash(bytes32 msgId) external;

        /// Whether a transfer has already been finalized on-chain.
        function finalized(bytes32 msgId) external view returns (bool);

        /// Current claim for a message, if any.
        function requestClaim(bytes32 msgId) external view returns (
            address solver,
            uint256 bond,
            uint64 claimedAt,
            uint64 deadline,
            bool released
        );

        /// Escrow balance available for a token.
        function bridgeBalance(address token) external view returns (uint256);

        /// Events
        event BridgeInitiated(
            bytes32 indexed msgId,
            address indexed sender,
            address token,
            uint256 amountAfterFee,
            bytes envelope
        );

        event BridgeClaimed(
            bytes32 indexed msgId,
            address indexed solver,
            uint256 bond,
            uint64 claimedAt,
            uint64 deadline
        );
    }
}
